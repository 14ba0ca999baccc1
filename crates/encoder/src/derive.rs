//! Parameter derivation rules -- free functions that turn encoder state into
//! the numeric fields of stage parameter blocks.

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::debug;

use kp_common::config::{EncoderCaps, FeatureFlags, KernelMode, MAX_QP};
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::kernel::{KernelKey, KernelOperation};
use kp_common::types::PictureCodingType;

use crate::frame::{FrameContext, MbRect, RoiRegion};
use crate::layout::MAX_INLINE_REGIONS;
use crate::stage::ScoreboardPattern;
use crate::tables::{
    ModeCosts, SearchWindow, BRC_CONSTANT_DATA_SIZE, BRC_CONST_MODE_COST_OFFSET,
    BRC_CONST_QP_ADJUST_OFFSET, BRC_CONST_REF_QP_OFFSET, BRC_CONST_REF_QP_SIZE,
    BRC_CONST_SKIP_OFFSET, BRC_QP_ADJUST, FULL_SEARCH_PRESETS, MODE_MV_COSTS, NUM_QP,
    REF_QP_UNSET, SEARCH_PATHS, SEARCH_PATH_BYTES, SEARCH_WINDOW_PRESETS, SKIP_THRESHOLDS,
};

/// Exhaustive motion search.
pub const ME_METHOD_FULL: u8 = 4;
/// Diamond motion search.
pub const ME_METHOD_DIAMOND: u8 = 6;

/// Largest explicit search window area in pixels.
pub const MAX_SEARCH_AREA: u32 = 2048;
/// Largest explicit search window dimension.
pub const MAX_SEARCH_DIM: u8 = 64;
/// B pictures search at most this far unless B refinement is disabled.
pub const B_SEARCH_DIM_CAP: u8 = 32;

// ---------------------------------------------------------------------------
// Search windows
// ---------------------------------------------------------------------------

/// Caller-supplied window for preset 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExplicitWindow {
    pub width: u8,
    pub height: u8,
    /// 0 = default (full), 1 = diamond, 2 = full.
    pub search_path: u8,
    pub path_len: u8,
}

/// Resolved search settings for the macroblock-encode stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SearchSettings {
    pub window: SearchWindow,
    pub me_method: u8,
}

/// Look up a search window preset.
///
/// Presets 1..=8 come from the fixed table. Preset 0 takes `explicit`, which
/// must stay within a 2048-pixel area and 64 pixels per dimension.
pub fn search_window(preset: u8, explicit: Option<ExplicitWindow>) -> PipelineResult<SearchSettings> {
    match preset {
        0 => {
            let window = explicit.ok_or_else(|| {
                PipelineError::invalid("search window preset 0 needs explicit dimensions")
            })?;
            validate_explicit(&window)?;
            let me_method = if window.search_path == 1 {
                ME_METHOD_DIAMOND
            } else {
                ME_METHOD_FULL
            };
            Ok(SearchSettings {
                window: SearchWindow {
                    width: window.width,
                    height: window.height,
                    path_len: window.path_len,
                },
                me_method,
            })
        }
        1..=8 => {
            let me_method = if FULL_SEARCH_PRESETS.contains(&preset) {
                ME_METHOD_FULL
            } else {
                ME_METHOD_DIAMOND
            };
            Ok(SearchSettings {
                window: SEARCH_WINDOW_PRESETS[preset as usize],
                me_method,
            })
        }
        other => Err(PipelineError::invalid(format!(
            "unknown search window preset {other}"
        ))),
    }
}

fn validate_explicit(window: &ExplicitWindow) -> PipelineResult<()> {
    if window.search_path > 2 {
        return Err(PipelineError::invalid(format!(
            "search path {} is not 0, 1 or 2",
            window.search_path
        )));
    }
    let area = u32::from(window.width) * u32::from(window.height);
    if area > MAX_SEARCH_AREA || window.width > MAX_SEARCH_DIM || window.height > MAX_SEARCH_DIM {
        return Err(PipelineError::invalid(format!(
            "search window {}x{} exceeds {MAX_SEARCH_DIM}x{MAX_SEARCH_DIM} / {MAX_SEARCH_AREA} pixels",
            window.width, window.height
        )));
    }
    Ok(())
}

/// Clamp the window for B pictures.
pub fn cap_window_for_b(window: SearchWindow, coding_type: PictureCodingType, disable_b_me: bool) -> SearchWindow {
    if coding_type != PictureCodingType::B || disable_b_me {
        return window;
    }
    SearchWindow {
        width: window.width.min(B_SEARCH_DIM_CAP),
        height: window.height.min(B_SEARCH_DIM_CAP),
        ..window
    }
}

/// Search path bytes for a coding type and ME method.
pub fn search_path(coding_type: PictureCodingType, me_method: u8) -> &'static [u8; SEARCH_PATH_BYTES] {
    let b = usize::from(coding_type == PictureCodingType::B);
    &SEARCH_PATHS[b][usize::from(me_method) % 8]
}

// ---------------------------------------------------------------------------
// Kernel selection
// ---------------------------------------------------------------------------

/// Macroblock-encode kernel for the coding type and kernel mode.
///
/// The normal kernel set is laid out quality / normal / performance, three
/// frame types each; the advanced set has one kernel per frame type.
pub fn mbenc_kernel_key(advanced: bool, mode: KernelMode, coding_type: PictureCodingType) -> KernelKey {
    let frame_offset = coding_type.table_index() as u32;
    if advanced {
        return KernelKey::new(KernelOperation::MbEncAdv, frame_offset);
    }
    let mode_offset = match mode {
        KernelMode::Quality => 0,
        KernelMode::Normal => 3,
        KernelMode::Performance => 6,
    };
    KernelKey::new(KernelOperation::MbEnc, mode_offset + frame_offset)
}

/// Wavefront dependency for the software scoreboard.
pub fn scoreboard_pattern(coding_type: PictureCodingType, direct_spatial: bool) -> ScoreboardPattern {
    match coding_type {
        PictureCodingType::I => ScoreboardPattern::Degree45,
        PictureCodingType::P => ScoreboardPattern::Degree26,
        PictureCodingType::B if direct_spatial => ScoreboardPattern::Degree26,
        PictureCodingType::B => ScoreboardPattern::Degree45,
    }
}

// ---------------------------------------------------------------------------
// QP
// ---------------------------------------------------------------------------

/// Slice QP for the macroblock-encode stage.
///
/// The advanced kernel running under rate control starts from the maximum QP
/// and lets the rate-control kernels lower it.
pub fn slice_qp(ctx: &FrameContext, advanced_under_brc: bool) -> PipelineResult<u8> {
    if advanced_under_brc {
        return Ok(MAX_QP);
    }
    let qp = i32::from(ctx.pic_init_qp) + i32::from(ctx.slice_qp_delta);
    if !(0..=i32::from(MAX_QP)).contains(&qp) {
        return Err(PipelineError::invalid(format!(
            "slice QP {qp} outside 0..={MAX_QP}"
        )));
    }
    Ok(qp as u8)
}

/// Mode/MV costs for `(coding type, qp)`.
pub fn mode_costs(coding_type: PictureCodingType, qp: u8) -> ModeCosts {
    MODE_MV_COSTS[coding_type.table_index()][usize::from(qp.min(MAX_QP))]
}

/// Skip threshold for `(coding type, qp)`; intra pictures never skip.
pub fn skip_threshold(coding_type: PictureCodingType, qp: u8) -> u16 {
    let qp = usize::from(qp.min(MAX_QP));
    match coding_type {
        PictureCodingType::I => 0,
        PictureCodingType::P => SKIP_THRESHOLDS[0][qp],
        PictureCodingType::B => SKIP_THRESHOLDS[1][qp],
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// Per-frame region handling after applying support rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegionSelection {
    None,
    Roi(Vec<RoiRegion>),
    DirtyRects(Vec<MbRect>),
}

impl RegionSelection {
    /// Number of rectangles carried.
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Roi(list) => list.len(),
            Self::DirtyRects(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decide between ROI and dirty rectangles for this frame.
///
/// Supplying both is a malformed request. ROI is dropped without error when
/// per-block QP deltas are unavailable (rate control without ROI support and
/// no MB QP map). Dirty rectangles only apply to P pictures whose L0[0] is
/// the previous reconstruction.
pub fn resolve_regions(
    ctx: &FrameContext,
    features: &FeatureFlags,
    caps: &EncoderCaps,
    brc_enabled: bool,
) -> PipelineResult<RegionSelection> {
    let has_roi = features.roi && !ctx.roi.is_empty();
    let has_dirty = features.dirty_rect && !ctx.dirty_rects.is_empty();
    if has_roi && has_dirty {
        return Err(PipelineError::invalid(
            "ROI and dirty rectangles are mutually exclusive",
        ));
    }

    if has_roi {
        let qp_delta_supported = if brc_enabled {
            caps.brc_roi_supported
        } else {
            true
        } || features.mb_qp;
        if !qp_delta_supported {
            debug!(frame = ctx.frame.0, "ROI disabled: no per-block QP delta support");
            return Ok(RegionSelection::None);
        }
        check_region_count("ROI", ctx.roi.len())?;
        return Ok(RegionSelection::Roi(ctx.roi.clone()));
    }

    if has_dirty {
        if ctx.coding_type == PictureCodingType::P && ctx.prev_recon_is_l0_ref {
            check_region_count("dirty", ctx.dirty_rects.len())?;
            return Ok(RegionSelection::DirtyRects(ctx.dirty_rects.clone()));
        }
        debug!(frame = ctx.frame.0, "Dirty rectangles ignored for this picture");
    }

    Ok(RegionSelection::None)
}

fn check_region_count(what: &str, count: usize) -> PipelineResult<()> {
    if count > MAX_INLINE_REGIONS {
        return Err(PipelineError::invalid(format!(
            "{count} {what} rectangles exceed the limit of {MAX_INLINE_REGIONS}"
        )));
    }
    Ok(())
}

/// Clip a constant-QP ROI delta so that `qp + delta` stays in 0..=51.
pub fn clip_roi_delta(qp: u8, delta: i8) -> i8 {
    let qp = i16::from(qp.min(MAX_QP));
    let target = (qp + i16::from(delta)).clamp(0, i16::from(MAX_QP));
    (target - qp) as i8
}

/// ROI weighting for macroblock-level rate control:
/// `min(51, 2 * (frame area / ROI area - 1))`.
pub fn roi_ratio(num_mbs: u32, regions: &[RoiRegion]) -> u8 {
    let roi_area: u64 = regions.iter().map(|r| r.rect.pixel_area()).sum();
    if roi_area == 0 {
        return 0;
    }
    let frame_area = u64::from(num_mbs) * 256;
    let ratio = 2 * (frame_area / roi_area).saturating_sub(1);
    ratio.min(u64::from(MAX_QP)) as u8
}

/// Whether the macroblock constant data surface must be bound.
pub fn mb_const_data_in_use(features: &FeatureFlags, regions: &RegionSelection, brc_enabled: bool) -> bool {
    (features.mb_brc && brc_enabled)
        || features.mb_qp
        || features.rolling_intra_refresh
        || !matches!(regions, RegionSelection::None)
}

// ---------------------------------------------------------------------------
// BRC constant data
// ---------------------------------------------------------------------------

/// Populate the rate-control constant data buffer for a picture type.
///
/// Layout: QP-adjust table, skip thresholds (P/B only), per-reference QP
/// lists set to "unset", mode/MV costs per QP. A destination shorter than
/// the layout is a `CopyFailure`.
pub fn init_brc_constant_data(coding_type: PictureCodingType, dest: &mut [u8]) -> PipelineResult<()> {
    if dest.len() < BRC_CONSTANT_DATA_SIZE {
        return Err(PipelineError::CopyFailure {
            table: "brc_constant_data",
            needed: BRC_CONSTANT_DATA_SIZE,
            available: dest.len(),
        });
    }
    let dest = &mut dest[..BRC_CONSTANT_DATA_SIZE];
    dest.fill(0);

    for (class, row) in BRC_QP_ADJUST.iter().enumerate() {
        for (bin, delta) in row.iter().enumerate() {
            dest[BRC_CONST_QP_ADJUST_OFFSET + class * row.len() + bin] = *delta as u8;
        }
    }

    if !coding_type.is_intra() {
        for qp in 0..NUM_QP {
            let threshold = skip_threshold(coding_type, qp as u8);
            let at = BRC_CONST_SKIP_OFFSET + qp * 2;
            (&mut dest[at..]).write_u16::<LittleEndian>(threshold)?;
        }
    }

    dest[BRC_CONST_REF_QP_OFFSET..BRC_CONST_REF_QP_OFFSET + BRC_CONST_REF_QP_SIZE].fill(REF_QP_UNSET);

    for qp in 0..NUM_QP {
        let at = BRC_CONST_MODE_COST_OFFSET + qp * 16;
        dest[at..at + 16].copy_from_slice(&mode_costs(coding_type, qp as u8).to_bytes());
    }

    Ok(())
}
