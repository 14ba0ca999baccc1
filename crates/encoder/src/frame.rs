//! Per-frame inputs: picture identity, reference lists, weighted prediction
//! state, regions of interest and the surfaces the frame's stages bind.

use kp_common::device::SurfaceHandle;
use kp_common::types::{FrameNumber, PictureCodingType, PictureStructure, RefList, ScaleFactor};

/// Identity of a picture buffer in the application's reconstructed-picture pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PictureId(pub u32);

/// Full-resolution and downscaled surfaces belonging to one picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureSurfaces {
    pub raw: SurfaceHandle,
    pub scaled_4x: SurfaceHandle,
    pub scaled_16x: SurfaceHandle,
    pub scaled_32x: SurfaceHandle,
}

impl PictureSurfaces {
    pub fn scaled(&self, factor: ScaleFactor) -> SurfaceHandle {
        match factor {
            ScaleFactor::X4 => self.scaled_4x,
            ScaleFactor::X16 => self.scaled_16x,
            ScaleFactor::X32 => self.scaled_32x,
        }
    }
}

/// A picture plus the version of its contents.
///
/// The version changes whenever the buffer is refilled with a new source,
/// which invalidates any downscaled copies made from the old contents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureRef {
    pub id: PictureId,
    pub version: u64,
    pub surfaces: PictureSurfaces,
}

/// Explicit weighted prediction state from the picture parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WeightedPrediction {
    /// P/SP pictures use explicit weights.
    pub weighted_pred_flag: bool,
    /// B-picture mode: 0 default, 1 explicit, 2 implicit.
    pub weighted_bipred_idc: u8,
    /// Bit `i` set: reference `i` of L0 carries a luma weight.
    pub luma_weight_l0: u32,
    /// Bit `i` set: reference `i` of L1 carries a luma weight.
    pub luma_weight_l1: u32,
}

/// `weighted_bipred_idc` value selecting explicit weights.
pub const BIPRED_EXPLICIT: u8 = 1;

impl WeightedPrediction {
    /// Whether explicit weighting applies to this coding type at all.
    pub fn active_for(&self, coding_type: PictureCodingType) -> bool {
        match coding_type {
            PictureCodingType::P => self.weighted_pred_flag,
            PictureCodingType::B => self.weighted_bipred_idc == BIPRED_EXPLICIT,
            PictureCodingType::I => false,
        }
    }

    pub fn weight_flag(&self, list: RefList, index: usize) -> bool {
        let mask = match list {
            RefList::L0 => self.luma_weight_l0,
            RefList::L1 => self.luma_weight_l1,
        };
        index < 32 && mask & (1 << index) != 0
    }
}

/// A rectangle in macroblock units (`left..right`, `top..bottom`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl MbRect {
    /// Area in pixels.
    pub fn pixel_area(&self) -> u64 {
        let w = 16 * u64::from(self.right.abs_diff(self.left));
        let h = 16 * u64::from(self.bottom.abs_diff(self.top));
        w * h
    }
}

/// Region of interest with a QP delta (or a priority under rate control).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoiRegion {
    pub rect: MbRect,
    pub qp_delta: i8,
}

/// Rolling intra refresh direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntraRefreshMode {
    Column,
    Row,
}

/// Rolling intra refresh request for the sequence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntraRefresh {
    pub mode: IntraRefreshMode,
    /// Refresh unit width (columns) or height (rows) in macroblocks.
    pub unit_in_mbs: u32,
    pub qp_delta: i8,
}

/// Surfaces written or read by this frame's stages besides the pictures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSurfaces {
    /// Motion-vector output of each HME level, coarse levels feed finer ones.
    pub me_mv_32x: SurfaceHandle,
    pub me_mv_16x: SurfaceHandle,
    pub me_mv_4x: SurfaceHandle,
    pub me_distortion: SurfaceHandle,
    pub mb_code: SurfaceHandle,
    pub mv_data: SurfaceHandle,
    pub brc_history: SurfaceHandle,
    pub brc_distortion: SurfaceHandle,
    pub brc_image_state: SurfaceHandle,
    pub pak_statistics: SurfaceHandle,
    pub mb_qp: Option<SurfaceHandle>,
    /// Weighted-prediction outputs, one per weighted L0 reference.
    pub weighted_l0: Vec<SurfaceHandle>,
    /// Weighted-prediction outputs, one per weighted L1 reference.
    pub weighted_l1: Vec<SurfaceHandle>,
    pub external_mv: Option<SurfaceHandle>,
}

impl FrameSurfaces {
    pub fn me_mv(&self, factor: ScaleFactor) -> SurfaceHandle {
        match factor {
            ScaleFactor::X4 => self.me_mv_4x,
            ScaleFactor::X16 => self.me_mv_16x,
            ScaleFactor::X32 => self.me_mv_32x,
        }
    }

    pub fn weighted(&self, list: RefList, index: usize) -> Option<SurfaceHandle> {
        match list {
            RefList::L0 => self.weighted_l0.get(index).copied(),
            RefList::L1 => self.weighted_l1.get(index).copied(),
        }
    }
}

/// Everything the pipeline needs to know about the frame being encoded.
#[derive(Clone, Debug)]
pub struct FrameContext {
    pub frame: FrameNumber,
    pub coding_type: PictureCodingType,
    pub structure: PictureStructure,
    /// First field of a field pair (always true for frame pictures).
    pub first_field: bool,
    pub current: PictureRef,
    pub recon: SurfaceHandle,
    pub l0: Vec<PictureRef>,
    pub l1: Vec<PictureRef>,
    pub weights: WeightedPrediction,
    /// B pictures: spatial (true) or temporal (false) direct prediction.
    pub direct_spatial: bool,
    pub is_reference: bool,
    pub pic_init_qp: u8,
    pub slice_qp_delta: i8,
    pub roi: Vec<RoiRegion>,
    pub dirty_rects: Vec<MbRect>,
    /// The previous reconstructed picture equals L0[0] (dirty rects are only
    /// meaningful against it).
    pub prev_recon_is_l0_ref: bool,
    pub surfaces: FrameSurfaces,
}

impl FrameContext {
    pub fn references(&self, list: RefList) -> &[PictureRef] {
        match list {
            RefList::L0 => &self.l0,
            RefList::L1 => &self.l1,
        }
    }

    /// References searched by motion estimation for this coding type.
    pub fn active_references(&self) -> impl Iterator<Item = &PictureRef> {
        let l1: &[PictureRef] = if self.coding_type == PictureCodingType::B {
            &self.l1
        } else {
            &[]
        };
        let l0: &[PictureRef] = if self.coding_type.is_intra() {
            &[]
        } else {
            &self.l0
        };
        l0.iter().chain(l1.iter())
    }
}

/// Rate-control inputs that arrive with each frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrcFrameInput {
    /// Frames skipped by the application since the previous update.
    pub num_skip_frames: u32,
    /// Total size of those skipped frames in bits.
    pub size_skip_frames: u32,
    /// Bytes of headers inserted by the application before this picture.
    pub header_bytes: u32,
    /// Index of the current picture's QP in the per-reference QP table.
    pub qp_index: Option<u8>,
    /// Rolling intra refresh request, when enabled for the sequence.
    pub intra_refresh: Option<IntraRefresh>,
}

/// Statistics the macroblock-encode stage reports for a finished frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    pub frame: FrameNumber,
    pub bits_produced: u64,
    pub distortion: u64,
    pub skipped_mbs: u32,
    /// Average QP the frame was coded with.
    pub average_qp: u8,
}
