//! Parameter block layouts per hardware generation.
//!
//! Every stage reads a fixed-size, little-endian parameter block. The block
//! size and the packing differ between generations, so the layout is a
//! tagged variant chosen once when the kernel binaries are loaded. Packing
//! writes into a zeroed block of exactly [`ParameterBlockLayout::block_size`]
//! bytes; anything not written stays zero.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use kp_common::config::HwGeneration;
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::types::{PictureCodingType, PictureStructure, RefList, ScaleFactor};

use crate::brc::{BrcSettings, BrcUpdateOutput, IntraRefreshPosition};
use crate::derive::{RegionSelection, SearchSettings};
use crate::frame::IntraRefreshMode;
use crate::stage::{MvPredictor, ScoreboardPattern, StageKind};
use crate::tables::{ModeCosts, SEARCH_PATH_BYTES};

// ---------------------------------------------------------------------------
// Block sizes
// ---------------------------------------------------------------------------

/// Block sizes in [`StageKind::ALL`] order. Zero: the stage does not exist
/// on that generation.
const GEN9_SIZES: [usize; 9] = [128, 64, 128, 0, 64, 128, 64, 32, 256];
const GEN11_SIZES: [usize; 9] = [128, 64, 128, 0, 64, 160, 64, 32, 320];
const GEN12_SIZES: [usize; 9] = [128, 64, 160, 64, 64, 160, 64, 32, 352];

/// Blocks are loaded in 32-byte register units.
pub const BLOCK_ALIGN: usize = 32;

/// Rectangles carried inline in the macroblock-encode block.
pub const MAX_INLINE_REGIONS: usize = 4;

const fn sizes_aligned(sizes: &[usize; 9]) -> bool {
    let mut i = 0;
    while i < sizes.len() {
        if sizes[i] % BLOCK_ALIGN != 0 {
            return false;
        }
        i += 1;
    }
    true
}

const fn sizes_grow(older: &[usize; 9], newer: &[usize; 9]) -> bool {
    let mut i = 0;
    while i < older.len() {
        if newer[i] < older[i] {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(sizes_aligned(&GEN9_SIZES));
const _: () = assert!(sizes_aligned(&GEN11_SIZES));
const _: () = assert!(sizes_aligned(&GEN12_SIZES));
const _: () = assert!(sizes_grow(&GEN9_SIZES, &GEN11_SIZES));
const _: () = assert!(sizes_grow(&GEN11_SIZES, &GEN12_SIZES));

// ---------------------------------------------------------------------------
// Stage parameters
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct BrcInitResetParams {
    pub settings: BrcSettings,
    pub reset: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScaleParams {
    pub input_width: u32,
    pub input_height: u32,
    pub factor: ScaleFactor,
    pub structure: PictureStructure,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeParams {
    pub level: ScaleFactor,
    pub coding_type: PictureCodingType,
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub predictor: MvPredictor,
    pub num_refs_l0: u8,
    pub num_refs_l1: u8,
    pub search: SearchSettings,
    pub search_path: [u8; SEARCH_PATH_BYTES],
    pub qp: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwScoreboardParams {
    pub pattern: ScoreboardPattern,
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IFrameDistParams {
    /// Dimensions of the 4x-downscaled picture, in macroblocks.
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbBrcUpdateParams {
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub roi_enabled: bool,
    pub roi_ratio: u8,
    pub intra_refresh: Option<IntraRefreshPosition>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WeightedPredParams {
    pub list: RefList,
    pub ref_index: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MbEncParams {
    pub coding_type: PictureCodingType,
    pub structure: PictureStructure,
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub slice_qp: u8,
    pub costs: ModeCosts,
    pub skip_threshold: u16,
    pub search: SearchSettings,
    pub search_path: [u8; SEARCH_PATH_BYTES],
    pub predictor: MvPredictor,
    pub num_refs_l0: u8,
    pub num_refs_l1: u8,
    pub direct_spatial: bool,
    pub mb_const_data: bool,
    pub mb_brc: bool,
    pub advanced: bool,
    pub regions: RegionSelection,
    pub scoreboard: ScoreboardPattern,
}

/// Derived values for one stage, ready to be packed.
#[derive(Clone, Debug, PartialEq)]
pub enum StageParameters {
    BrcInitReset(BrcInitResetParams),
    Scale(ScaleParams),
    Me(MeParams),
    SwScoreboard(SwScoreboardParams),
    BrcIFrameDist(IFrameDistParams),
    BrcFrameUpdate(BrcUpdateOutput),
    BrcMbUpdate(MbBrcUpdateParams),
    WeightedPred(WeightedPredParams),
    MbEnc(MbEncParams),
}

impl StageParameters {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::BrcInitReset(_) => StageKind::BrcInitReset,
            Self::Scale(_) => StageKind::Scale,
            Self::Me(_) => StageKind::Me,
            Self::SwScoreboard(_) => StageKind::SwScoreboard,
            Self::BrcIFrameDist(_) => StageKind::BrcIFrameDist,
            Self::BrcFrameUpdate(_) => StageKind::BrcFrameUpdate,
            Self::BrcMbUpdate(_) => StageKind::BrcMbUpdate,
            Self::WeightedPred(_) => StageKind::WeightedPred,
            Self::MbEnc(_) => StageKind::MbEnc,
        }
    }
}

// ---------------------------------------------------------------------------
// ParameterBlockLayout
// ---------------------------------------------------------------------------

/// Generation-specific parameter block layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParameterBlockLayout {
    Gen9,
    Gen11,
    Gen12,
}

impl ParameterBlockLayout {
    pub fn for_generation(generation: HwGeneration) -> Self {
        match generation {
            HwGeneration::Gen9 => Self::Gen9,
            HwGeneration::Gen11 => Self::Gen11,
            HwGeneration::Gen12 => Self::Gen12,
        }
    }

    fn sizes(self) -> &'static [usize; 9] {
        match self {
            Self::Gen9 => &GEN9_SIZES,
            Self::Gen11 => &GEN11_SIZES,
            Self::Gen12 => &GEN12_SIZES,
        }
    }

    /// Parameter block size for a stage kind.
    pub fn block_size(self, kind: StageKind) -> PipelineResult<usize> {
        match self.sizes()[kind as usize] {
            0 => Err(PipelineError::invalid(format!(
                "{kind} stage has no parameter layout on {self:?}"
            ))),
            size => Ok(size),
        }
    }

    /// Pack `params` into the front of `block`, zeroing the rest of the
    /// stage's block. Returns the number of bytes written.
    pub fn pack(self, params: &StageParameters, block: &mut [u8]) -> PipelineResult<usize> {
        let kind = params.kind();
        let size = self.block_size(kind)?;
        if block.len() < size {
            return Err(PipelineError::CopyFailure {
                table: kind.name(),
                needed: size,
                available: block.len(),
            });
        }
        if let StageParameters::MbEnc(p) = params {
            if p.regions.len() > MAX_INLINE_REGIONS {
                return Err(PipelineError::invalid(format!(
                    "MbEnc block holds at most {MAX_INLINE_REGIONS} regions, got {}",
                    p.regions.len()
                )));
            }
        }
        let region = &mut block[..size];
        region.fill(0);

        let mut w: &mut [u8] = region;
        match params {
            StageParameters::BrcInitReset(p) => pack_brc_init_reset(&mut w, p)?,
            StageParameters::Scale(p) => pack_scale(&mut w, p)?,
            StageParameters::Me(p) => {
                pack_me(&mut w, p)?;
                if self == Self::Gen12 {
                    // Gen12 reads the B-window cap flag and the block count.
                    w.write_u8(u8::from(p.coding_type == PictureCodingType::B))?;
                    w.write_u32::<LittleEndian>(p.width_in_mbs * p.height_in_mbs)?;
                }
            }
            StageParameters::SwScoreboard(p) => pack_sw_scoreboard(&mut w, p)?,
            StageParameters::BrcIFrameDist(p) => {
                w.write_u16::<LittleEndian>(p.width_in_mbs as u16)?;
                w.write_u16::<LittleEndian>(p.height_in_mbs as u16)?;
            }
            StageParameters::BrcFrameUpdate(p) => {
                pack_brc_update(&mut w, p)?;
                if self != Self::Gen9 {
                    pack_brc_update_ext(&mut w, p)?;
                }
            }
            StageParameters::BrcMbUpdate(p) => pack_mb_brc_update(&mut w, p)?,
            StageParameters::WeightedPred(p) => {
                w.write_u8(match p.list {
                    RefList::L0 => 0,
                    RefList::L1 => 1,
                })?;
                w.write_u8(p.ref_index)?;
            }
            StageParameters::MbEnc(p) => {
                pack_mbenc(&mut w, p)?;
                if self != Self::Gen9 {
                    pack_regions(&mut w, &p.regions)?;
                }
                if self == Self::Gen12 {
                    w.write_u8(scoreboard_code(p.scoreboard))?;
                    w.write_u32::<LittleEndian>(p.width_in_mbs * p.height_in_mbs)?;
                }
            }
        }
        Ok(size - w.len())
    }
}

// ---------------------------------------------------------------------------
// Packing helpers
// ---------------------------------------------------------------------------

fn predictor_code(predictor: MvPredictor) -> (u8, u8) {
    match predictor {
        MvPredictor::None => (0, 0),
        MvPredictor::Zero => (1, 0),
        MvPredictor::Hme(level) => (2, level.factor() as u8),
        MvPredictor::External => (3, 0),
    }
}

fn scoreboard_code(pattern: ScoreboardPattern) -> u8 {
    match pattern {
        ScoreboardPattern::Degree45 => 0,
        ScoreboardPattern::Degree26 => 1,
    }
}

fn structure_code(structure: PictureStructure) -> u8 {
    match structure {
        PictureStructure::Frame => 0,
        PictureStructure::TopField => 1,
        PictureStructure::BottomField => 2,
    }
}

fn flags(bits: &[bool]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, &set)| acc | (u8::from(set) << i))
}

fn pack_brc_init_reset<W: Write>(w: &mut W, p: &BrcInitResetParams) -> io::Result<()> {
    let s = &p.settings;
    w.write_u32::<LittleEndian>(s.average_bitrate)?;
    w.write_u32::<LittleEndian>(s.max_bitrate)?;
    w.write_u32::<LittleEndian>(s.buffer_size_bits)?;
    w.write_u32::<LittleEndian>(s.init_fullness_bits)?;
    w.write_u32::<LittleEndian>(s.frame_rate.num)?;
    w.write_u32::<LittleEndian>(s.frame_rate.den)?;
    w.write_f64::<LittleEndian>(s.input_bits_per_frame)?;
    w.write_f64::<LittleEndian>(s.bps_ratio)?;
    w.write_u32::<LittleEndian>(s.gop_p)?;
    w.write_u32::<LittleEndian>(s.gop_b)?;
    w.write_u16::<LittleEndian>(s.width_in_mbs as u16)?;
    w.write_u16::<LittleEndian>(s.height_in_mbs as u16)?;
    w.write_u8(s.min_qp)?;
    w.write_u8(s.max_qp)?;
    w.write_u8(s.rc_mode as u8)?;
    w.write_u8(flags(&[p.reset, s.field_coding, s.quality_factor.is_some()]))?;
    w.write_u16::<LittleEndian>(s.quality_factor.unwrap_or(0))?;
    w.write_u8(s.sliding_window_size as u8)?;
    for row in [&s.thresholds.pb, &s.thresholds.vbr, &s.thresholds.i] {
        for t in row.iter() {
            w.write_i8(*t)?;
        }
    }
    Ok(())
}

fn pack_scale<W: Write>(w: &mut W, p: &ScaleParams) -> io::Result<()> {
    let factor = p.factor.factor();
    w.write_u32::<LittleEndian>(p.input_width)?;
    w.write_u32::<LittleEndian>(p.input_height)?;
    w.write_u32::<LittleEndian>(p.input_width / factor)?;
    w.write_u32::<LittleEndian>(p.input_height / factor)?;
    w.write_u8(factor as u8)?;
    w.write_u8(structure_code(p.structure))?;
    Ok(())
}

fn pack_search<W: Write>(w: &mut W, search: &SearchSettings, path: &[u8; SEARCH_PATH_BYTES]) -> io::Result<()> {
    w.write_u8(search.window.width)?;
    w.write_u8(search.window.height)?;
    w.write_u8(search.window.path_len)?;
    w.write_u8(search.me_method)?;
    w.write_all(path)
}

fn pack_me<W: Write>(w: &mut W, p: &MeParams) -> io::Result<()> {
    let (pred, pred_level) = predictor_code(p.predictor);
    w.write_u16::<LittleEndian>(p.width_in_mbs as u16)?;
    w.write_u16::<LittleEndian>(p.height_in_mbs as u16)?;
    w.write_u8(p.level.factor() as u8)?;
    w.write_u8(p.coding_type.raw())?;
    w.write_u8(pred)?;
    w.write_u8(pred_level)?;
    w.write_u8(p.num_refs_l0)?;
    w.write_u8(p.num_refs_l1)?;
    w.write_u8(p.qp)?;
    pack_search(w, &p.search, &p.search_path)
}

fn pack_sw_scoreboard<W: Write>(w: &mut W, p: &SwScoreboardParams) -> io::Result<()> {
    w.write_u16::<LittleEndian>(p.width_in_mbs as u16)?;
    w.write_u16::<LittleEndian>(p.height_in_mbs as u16)?;
    w.write_u8(scoreboard_code(p.pattern))
}

fn pack_brc_update<W: Write>(w: &mut W, p: &BrcUpdateOutput) -> io::Result<()> {
    w.write_u32::<LittleEndian>(p.target_size)?;
    w.write_u8(u8::from(p.target_size_flag))?;
    w.write_u8(p.frame_type)?;
    w.write_u8(flags(&[
        p.field,
        p.bottom_field,
        p.is_reference,
        p.auto_pb_frame_size,
        p.extreme_low_delay,
        p.actual_qp_index.is_some(),
    ]))?;
    w.write_u8(p.actual_qp_index.unwrap_or(0))?;
    w.write_u32::<LittleEndian>(p.num_skip_frames)?;
    w.write_u32::<LittleEndian>(p.size_skip_frames)?;
    w.write_u32::<LittleEndian>(p.header_bits)?;
    w.write_u8(p.min_qp)?;
    w.write_u8(p.max_qp)?;
    w.write_u8(p.sliding_window_size as u8)?;
    w.write_u8(p.suggested_qp.unwrap_or(0xFF))?;
    w.write_u8(p.rounding_intra)
}

fn pack_intra_refresh<W: Write>(w: &mut W, refresh: Option<&IntraRefreshPosition>) -> io::Result<()> {
    match refresh {
        Some(r) => {
            w.write_u8(match r.mode {
                IntraRefreshMode::Column => 1,
                IntraRefreshMode::Row => 2,
            })?;
            w.write_u16::<LittleEndian>(r.first_mb as u16)?;
            w.write_u16::<LittleEndian>(r.unit_in_mbs as u16)?;
            w.write_i8(r.qp_delta)
        }
        None => w.write_all(&[0u8; 6]),
    }
}

fn pack_brc_update_ext<W: Write>(w: &mut W, p: &BrcUpdateOutput) -> io::Result<()> {
    for start in p.start_global_adjust {
        w.write_u32::<LittleEndian>(start)?;
    }
    w.write_all(&p.rate_ratio_thresholds)?;
    pack_intra_refresh(w, p.intra_refresh.as_ref())
}

fn pack_mb_brc_update<W: Write>(w: &mut W, p: &MbBrcUpdateParams) -> io::Result<()> {
    w.write_u16::<LittleEndian>(p.width_in_mbs as u16)?;
    w.write_u16::<LittleEndian>(p.height_in_mbs as u16)?;
    w.write_u8(u8::from(p.roi_enabled))?;
    w.write_u8(p.roi_ratio)?;
    pack_intra_refresh(w, p.intra_refresh.as_ref())
}

fn pack_mbenc<W: Write>(w: &mut W, p: &MbEncParams) -> io::Result<()> {
    let (pred, pred_level) = predictor_code(p.predictor);
    w.write_u16::<LittleEndian>(p.width_in_mbs as u16)?;
    w.write_u16::<LittleEndian>(p.height_in_mbs as u16)?;
    w.write_u8(p.coding_type.raw())?;
    w.write_u8(structure_code(p.structure))?;
    w.write_u8(p.slice_qp)?;
    w.write_u8(flags(&[p.direct_spatial, p.mb_const_data, p.mb_brc, p.advanced]))?;
    w.write_all(&p.costs.to_bytes())?;
    w.write_u16::<LittleEndian>(p.skip_threshold)?;
    pack_search(w, &p.search, &p.search_path)?;
    w.write_u8(pred)?;
    w.write_u8(pred_level)?;
    w.write_u8(p.num_refs_l0)?;
    w.write_u8(p.num_refs_l1)
}

fn pack_regions<W: Write>(w: &mut W, regions: &RegionSelection) -> io::Result<()> {
    let (kind, rects): (u8, Vec<_>) = match regions {
        RegionSelection::None => (0, Vec::new()),
        RegionSelection::Roi(list) => (1, list.iter().map(|r| (r.rect, r.qp_delta)).collect()),
        RegionSelection::DirtyRects(list) => (2, list.iter().map(|r| (*r, 0)).collect()),
    };
    w.write_u8(kind)?;
    w.write_u8(rects.len() as u8)?;
    for (rect, delta) in &rects {
        w.write_u16::<LittleEndian>(rect.left as u16)?;
        w.write_u16::<LittleEndian>(rect.top as u16)?;
        w.write_u16::<LittleEndian>(rect.right as u16)?;
        w.write_u16::<LittleEndian>(rect.bottom as u16)?;
        w.write_i8(*delta)?;
        w.write_u8(0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{mode_costs, search_path, search_window};
    use crate::frame::{MbRect, RoiRegion};
    use kp_common::config::{RateControlMode, SequenceParams};

    fn make_mbenc(regions: RegionSelection) -> MbEncParams {
        let search = search_window(4, None).unwrap();
        MbEncParams {
            coding_type: PictureCodingType::P,
            structure: PictureStructure::Frame,
            width_in_mbs: 120,
            height_in_mbs: 68,
            slice_qp: 26,
            costs: mode_costs(PictureCodingType::P, 26),
            skip_threshold: 170,
            search,
            search_path: *search_path(PictureCodingType::P, search.me_method),
            predictor: MvPredictor::Hme(ScaleFactor::X4),
            num_refs_l0: 1,
            num_refs_l1: 0,
            direct_spatial: false,
            mb_const_data: true,
            mb_brc: true,
            advanced: false,
            regions,
            scoreboard: ScoreboardPattern::Degree26,
        }
    }

    fn make_update() -> BrcUpdateOutput {
        BrcUpdateOutput {
            frame: kp_common::types::FrameNumber(3),
            target_size: 0x0102_0304,
            target_size_flag: true,
            num_skip_frames: 3,
            size_skip_frames: 12_000,
            header_bits: 320,
            frame_type: 0,
            field: false,
            bottom_field: false,
            is_reference: true,
            actual_qp_index: None,
            min_qp: 1,
            max_qp: 51,
            sliding_window_size: 0,
            extreme_low_delay: false,
            auto_pb_frame_size: false,
            start_global_adjust: [10, 50, 100, 150],
            rate_ratio_thresholds: [40, 75, 97, 103, 125, 160],
            intra_refresh: None,
            suggested_qp: Some(30),
            rounding_intra: 5,
        }
    }

    const LAYOUTS: [ParameterBlockLayout; 3] = [
        ParameterBlockLayout::Gen9,
        ParameterBlockLayout::Gen11,
        ParameterBlockLayout::Gen12,
    ];

    // ── Sizes ───────────────────────────────────────────────────────

    #[test]
    fn sw_scoreboard_only_on_gen12() {
        assert!(ParameterBlockLayout::Gen9
            .block_size(StageKind::SwScoreboard)
            .is_err());
        assert!(ParameterBlockLayout::Gen11
            .block_size(StageKind::SwScoreboard)
            .is_err());
        assert_eq!(
            ParameterBlockLayout::Gen12
                .block_size(StageKind::SwScoreboard)
                .unwrap(),
            64
        );
    }

    #[test]
    fn layout_follows_generation() {
        assert_eq!(
            ParameterBlockLayout::for_generation(HwGeneration::Gen11),
            ParameterBlockLayout::Gen11
        );
        assert_eq!(
            ParameterBlockLayout::Gen9.block_size(StageKind::MbEnc).unwrap(),
            256
        );
        assert_eq!(
            ParameterBlockLayout::Gen12.block_size(StageKind::MbEnc).unwrap(),
            352
        );
    }

    // ── Packing ─────────────────────────────────────────────────────

    #[test]
    fn every_stage_fits_every_layout() {
        let settings = BrcSettings::derive(&SequenceParams {
            rc_mode: RateControlMode::Avbr,
            ..SequenceParams::default()
        })
        .unwrap();
        let search = search_window(2, None).unwrap();
        let params = vec![
            StageParameters::BrcInitReset(BrcInitResetParams {
                settings,
                reset: false,
            }),
            StageParameters::Scale(ScaleParams {
                input_width: 1920,
                input_height: 1088,
                factor: ScaleFactor::X4,
                structure: PictureStructure::Frame,
            }),
            StageParameters::Me(MeParams {
                level: ScaleFactor::X16,
                coding_type: PictureCodingType::B,
                width_in_mbs: 8,
                height_in_mbs: 5,
                predictor: MvPredictor::None,
                num_refs_l0: 2,
                num_refs_l1: 1,
                search,
                search_path: *search_path(PictureCodingType::B, search.me_method),
                qp: 30,
            }),
            StageParameters::BrcIFrameDist(IFrameDistParams {
                width_in_mbs: 30,
                height_in_mbs: 17,
            }),
            StageParameters::BrcFrameUpdate(make_update()),
            StageParameters::BrcMbUpdate(MbBrcUpdateParams {
                width_in_mbs: 120,
                height_in_mbs: 68,
                roi_enabled: true,
                roi_ratio: 6,
                intra_refresh: None,
            }),
            StageParameters::WeightedPred(WeightedPredParams {
                list: RefList::L1,
                ref_index: 1,
            }),
            StageParameters::MbEnc(make_mbenc(RegionSelection::None)),
        ];
        for layout in LAYOUTS {
            for p in &params {
                let size = layout.block_size(p.kind()).unwrap();
                let mut block = vec![0xEEu8; size];
                let written = layout.pack(p, &mut block).unwrap();
                assert!(written > 0 && written <= size, "{:?} on {layout:?}", p.kind());
                assert!(block[written..].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn brc_update_is_little_endian() {
        let mut block = vec![0u8; 160];
        ParameterBlockLayout::Gen12
            .pack(&StageParameters::BrcFrameUpdate(make_update()), &mut block)
            .unwrap();
        assert_eq!(&block[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(block[4], 1);
        // num_skip_frames after target, flag, type, flags, qp index.
        assert_eq!(&block[8..12], &[3, 0, 0, 0]);
    }

    #[test]
    fn gen9_update_omits_extension() {
        let mut gen9 = vec![0u8; 128];
        let mut gen12 = vec![0u8; 160];
        let p = StageParameters::BrcFrameUpdate(make_update());
        let a = ParameterBlockLayout::Gen9.pack(&p, &mut gen9).unwrap();
        let b = ParameterBlockLayout::Gen12.pack(&p, &mut gen12).unwrap();
        assert!(b > a);
        assert_eq!(&gen9[..a], &gen12[..a]);
    }

    #[test]
    fn inline_regions_fill_the_block() {
        let rect = MbRect {
            left: 0,
            top: 0,
            right: 2,
            bottom: 2,
        };
        let roi = vec![RoiRegion { rect, qp_delta: -2 }; MAX_INLINE_REGIONS];
        let with_roi = make_mbenc(RegionSelection::Roi(roi));
        let without = make_mbenc(RegionSelection::None);

        let mut a = vec![0u8; 320];
        let mut b = vec![0u8; 320];
        let layout = ParameterBlockLayout::Gen11;
        let wa = layout.pack(&StageParameters::MbEnc(with_roi), &mut a).unwrap();
        let wb = layout.pack(&StageParameters::MbEnc(without), &mut b).unwrap();
        assert_eq!(wa - wb, MAX_INLINE_REGIONS * 10);
        // Region kind and count follow the common fields.
        assert_eq!(a[wb - 2], 1);
        assert_eq!(a[wb - 1], MAX_INLINE_REGIONS as u8);
    }

    #[test]
    fn too_many_regions_rejected() {
        let rect = MbRect {
            left: 0,
            top: 0,
            right: 2,
            bottom: 2,
        };
        let roi = vec![RoiRegion { rect, qp_delta: -2 }; MAX_INLINE_REGIONS + 2];
        let mut block = vec![0xAAu8; 320];
        let err = ParameterBlockLayout::Gen12
            .pack(&StageParameters::MbEnc(make_mbenc(RegionSelection::Roi(roi))), &mut block)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { .. }));
        assert!(block.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn short_block_is_copy_failure() {
        let mut block = vec![0u8; 16];
        let err = ParameterBlockLayout::Gen9
            .pack(&StageParameters::MbEnc(make_mbenc(RegionSelection::None)), &mut block)
            .unwrap_err();
        assert!(matches!(err, PipelineError::CopyFailure { needed: 256, available: 16, .. }));
    }

    #[test]
    fn scoreboard_on_gen9_is_invalid() {
        let mut block = vec![0u8; 64];
        let p = StageParameters::SwScoreboard(SwScoreboardParams {
            pattern: ScoreboardPattern::Degree45,
            width_in_mbs: 10,
            height_in_mbs: 10,
        });
        assert!(matches!(
            ParameterBlockLayout::Gen9.pack(&p, &mut block),
            Err(PipelineError::InvalidParameter { .. })
        ));
        assert_eq!(ParameterBlockLayout::Gen12.pack(&p, &mut block).unwrap(), 5);
    }
}
