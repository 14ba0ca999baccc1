//! Configuration structs for sequence parameters, feature flags and encoder
//! capabilities.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Rational, Resolution};

/// Highest QP accepted by the codec.
pub const MAX_QP: u8 = 51;

/// Bounds for the recycled buffer ring depth.
pub const MIN_RECYCLE_SLOTS: usize = 2;
pub const MAX_RECYCLE_SLOTS: usize = 8;

/// Rate-control method for a sequence.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateControlMode {
    /// Constant QP; no bitrate control kernels run.
    Cqp,
    #[default]
    Cbr,
    Vbr,
    /// Average VBR with accuracy/convergence targets.
    Avbr,
    /// Intelligent constant quality.
    Icq,
    /// Video-conferencing mode.
    Vcm,
    /// Quality-defined VBR.
    Qvbr,
}

impl RateControlMode {
    /// Whether bitrate control kernels are part of the pipeline.
    pub fn is_brc(self) -> bool {
        !matches!(self, Self::Cqp)
    }

    /// Modes that consume the quality factor as an adaptive QP ceiling.
    pub fn uses_quality_factor(self) -> bool {
        matches!(self, Self::Icq | Self::Qvbr)
    }
}

/// Frame-size tolerance requested by the application.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSizeTolerance {
    #[default]
    Normal,
    /// Enables the sliding-window frame size limiter.
    Low,
    /// Enables extreme low-delay mode.
    ExtremelyLow,
}

/// Sequence-level parameters supplied at Init and revisable via Reset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceParams {
    pub rc_mode: RateControlMode,
    pub resolution: Resolution,
    pub frame_rate: Rational,
    /// Target (average) bitrate in bits per second.
    pub target_bitrate: u32,
    /// Peak bitrate in bits per second. Zero means "same as target".
    pub max_bitrate: u32,
    /// Virtual buffer size in bits. Zero derives four frames' worth.
    pub vbv_buffer_size_bits: u32,
    /// Initial virtual buffer fullness in bits. Zero derives 7/8 of the buffer.
    pub init_vbv_fullness_bits: u32,
    pub gop_size: u32,
    /// Distance between anchor frames (1 = no B frames).
    pub gop_ref_dist: u32,
    pub min_qp: u8,
    pub max_qp: u8,
    /// Quality factor for ICQ / QVBR.
    pub icq_quality_factor: u16,
    pub avbr_accuracy: u16,
    pub avbr_convergence: u16,
    pub frame_size_tolerance: FrameSizeTolerance,
    pub auto_max_pb_frame_size: bool,
    /// Per-reference QP reporting (actual QP of each reference).
    pub multi_ref_qp: bool,
    /// Encoder target usage 1 (best quality) ..= 7 (fastest).
    pub target_usage: u8,
    /// Pictures are coded as field pairs (halves the per-picture bit budget).
    pub field_coding: bool,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            rc_mode: RateControlMode::Cbr,
            resolution: Resolution::HD,
            frame_rate: Rational::FPS_30,
            target_bitrate: 8_000_000,
            max_bitrate: 0,
            vbv_buffer_size_bits: 0,
            init_vbv_fullness_bits: 0,
            gop_size: 30,
            gop_ref_dist: 1,
            min_qp: 1,
            max_qp: MAX_QP,
            icq_quality_factor: 26,
            avbr_accuracy: 30,
            avbr_convergence: 150,
            frame_size_tolerance: FrameSizeTolerance::Normal,
            auto_max_pb_frame_size: false,
            multi_ref_qp: false,
            target_usage: 4,
            field_coding: false,
        }
    }
}

impl SequenceParams {
    /// Check the parameters the rate-control derivation depends on.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.frame_rate.num == 0 || self.frame_rate.den == 0 {
            return Err(PipelineError::invalid(format!(
                "invalid frame rate {}/{}",
                self.frame_rate.num, self.frame_rate.den
            )));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(PipelineError::invalid(format!(
                "invalid resolution {}",
                self.resolution
            )));
        }
        if self.min_qp > self.max_qp || self.max_qp > MAX_QP {
            return Err(PipelineError::invalid(format!(
                "invalid QP range [{}, {}]",
                self.min_qp, self.max_qp
            )));
        }
        if self.gop_size == 0 {
            return Err(PipelineError::invalid("GOP size must be at least 1"));
        }
        if !(1..=7).contains(&self.target_usage) {
            return Err(PipelineError::invalid(format!(
                "target usage {} outside 1..=7",
                self.target_usage
            )));
        }
        let needs_bitrate = self.rc_mode.is_brc() && self.rc_mode != RateControlMode::Icq;
        if needs_bitrate && self.target_bitrate == 0 {
            return Err(PipelineError::invalid(format!(
                "{:?} requires a non-zero target bitrate",
                self.rc_mode
            )));
        }
        Ok(())
    }

    /// Peak bitrate with the "zero means target" default applied.
    pub fn effective_max_bitrate(&self) -> u32 {
        if self.max_bitrate == 0 {
            self.target_bitrate
        } else {
            self.max_bitrate
        }
    }
}

/// Per-sequence feature switches that shape the stage graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// 4x hierarchical motion estimation.
    pub hme: bool,
    pub hme_16x: bool,
    pub hme_32x: bool,
    pub weighted_prediction: bool,
    pub external_mv_input: bool,
    /// Per-macroblock QP map supplied by the application.
    pub mb_qp: bool,
    /// Macroblock-level rate control.
    pub mb_brc: bool,
    /// Intra distortion estimation before the BRC frame update on I frames.
    pub brc_distortion: bool,
    pub roi: bool,
    pub dirty_rect: bool,
    /// Disable motion estimation refinement for B pictures.
    pub disable_b_me: bool,
    pub rolling_intra_refresh: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            hme: true,
            hme_16x: true,
            hme_32x: false,
            weighted_prediction: false,
            external_mv_input: false,
            mb_qp: false,
            mb_brc: true,
            brc_distortion: true,
            roi: false,
            dirty_rect: false,
            disable_b_me: false,
            rolling_intra_refresh: false,
        }
    }
}

/// Hardware generation; selects the parameter block layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwGeneration {
    Gen9,
    Gen11,
    #[default]
    Gen12,
}

/// Macroblock-encode kernel flavour derived from target usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelMode {
    Quality,
    #[default]
    Normal,
    Performance,
}

impl KernelMode {
    pub fn from_target_usage(target_usage: u8) -> Self {
        match target_usage {
            1 | 2 => Self::Quality,
            6 | 7 => Self::Performance,
            _ => Self::Normal,
        }
    }
}

/// Capability table the orchestrator is parameterized with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderCaps {
    pub generation: HwGeneration,
    pub hme_16x_supported: bool,
    pub hme_32x_supported: bool,
    pub mb_brc_supported: bool,
    /// Rate control honours per-region QP deltas.
    pub brc_roi_supported: bool,
    /// Use the advanced macroblock-encode kernel set.
    pub advanced_mbenc: bool,
    /// Weighted-prediction output surfaces available for list 0.
    pub max_weighted_l0: usize,
    /// Weighted-prediction output surfaces available for list 1.
    pub max_weighted_l1: usize,
    /// Depth of the recycled buffer ring.
    pub recycle_slots: usize,
}

impl Default for EncoderCaps {
    fn default() -> Self {
        Self {
            generation: HwGeneration::Gen12,
            hme_16x_supported: true,
            hme_32x_supported: true,
            mb_brc_supported: true,
            brc_roi_supported: true,
            advanced_mbenc: false,
            max_weighted_l0: 6,
            max_weighted_l1: 2,
            recycle_slots: 6,
        }
    }
}

impl EncoderCaps {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(MIN_RECYCLE_SLOTS..=MAX_RECYCLE_SLOTS).contains(&self.recycle_slots) {
            return Err(PipelineError::invalid(format!(
                "recycle slot count {} outside {MIN_RECYCLE_SLOTS}..={MAX_RECYCLE_SLOTS}",
                self.recycle_slots
            )));
        }
        if self.max_weighted_l0 > 6 || self.max_weighted_l1 > 2 {
            return Err(PipelineError::invalid(format!(
                "weighted surface caps L0={} L1={} exceed 6/2",
                self.max_weighted_l0, self.max_weighted_l1
            )));
        }
        Ok(())
    }
}

/// Everything needed to open an encode pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub caps: EncoderCaps,
    pub features: FeatureFlags,
    pub sequence: SequenceParams,
    /// How long acquiring an in-flight recycle slot may block.
    pub acquire_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            caps: EncoderCaps::default(),
            features: FeatureFlags::default(),
            sequence: SequenceParams::default(),
            acquire_timeout_ms: 2000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        self.caps.validate()?;
        self.sequence.validate()
    }
}
