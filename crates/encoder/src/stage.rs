//! Stage vocabulary shared by the orchestrator, resource manager and layouts.

use std::fmt;

use kp_common::kernel::KernelKey;
use kp_common::types::{FrameNumber, RefList, ScaleFactor};

/// Kind of GPU kernel stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    BrcInitReset,
    Scale,
    Me,
    SwScoreboard,
    BrcIFrameDist,
    BrcFrameUpdate,
    BrcMbUpdate,
    WeightedPred,
    MbEnc,
}

impl StageKind {
    pub const ALL: [Self; 9] = [
        Self::BrcInitReset,
        Self::Scale,
        Self::Me,
        Self::SwScoreboard,
        Self::BrcIFrameDist,
        Self::BrcFrameUpdate,
        Self::BrcMbUpdate,
        Self::WeightedPred,
        Self::MbEnc,
    ];

    /// Opcode carried in the command record.
    pub fn opcode(self) -> u16 {
        self as u16 + 1
    }

    /// Descriptor-table entries a dispatch of this kind binds.
    pub fn descriptor_slots(self) -> u32 {
        match self {
            Self::BrcInitReset => 2,
            Self::Scale => 6,
            Self::Me => 12,
            Self::SwScoreboard => 2,
            Self::BrcIFrameDist => 8,
            Self::BrcFrameUpdate => 12,
            Self::BrcMbUpdate => 8,
            Self::WeightedPred => 2,
            Self::MbEnc => 40,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BrcInitReset => "brc_init_reset",
            Self::Scale => "scale",
            Self::Me => "me",
            Self::SwScoreboard => "sw_scoreboard",
            Self::BrcIFrameDist => "brc_i_frame_dist",
            Self::BrcFrameUpdate => "brc_frame_update",
            Self::BrcMbUpdate => "brc_mb_update",
            Self::WeightedPred => "weighted_pred",
            Self::MbEnc => "mbenc",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stage instance within a frame. Stages that run more than once per
/// frame (per scale level, per weighted reference) carry their instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    BrcInitReset,
    Scale(ScaleFactor),
    Me(ScaleFactor),
    SwScoreboard,
    BrcIFrameDist,
    BrcFrameUpdate,
    BrcMbUpdate,
    WeightedPred(RefList, u8),
    MbEnc,
}

impl StageId {
    pub fn kind(self) -> StageKind {
        match self {
            Self::BrcInitReset => StageKind::BrcInitReset,
            Self::Scale(_) => StageKind::Scale,
            Self::Me(_) => StageKind::Me,
            Self::SwScoreboard => StageKind::SwScoreboard,
            Self::BrcIFrameDist => StageKind::BrcIFrameDist,
            Self::BrcFrameUpdate => StageKind::BrcFrameUpdate,
            Self::BrcMbUpdate => StageKind::BrcMbUpdate,
            Self::WeightedPred(..) => StageKind::WeightedPred,
            Self::MbEnc => StageKind::MbEnc,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scale(factor) => write!(f, "scale_{factor}"),
            Self::Me(factor) => write!(f, "me_{factor}"),
            Self::WeightedPred(list, idx) => write!(f, "weighted_pred_{list}_{idx}"),
            other => f.write_str(other.kind().name()),
        }
    }
}

/// Motion-vector predictor fed into a motion search stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MvPredictor {
    /// No predictor is expected (coarsest level, or no HME at all).
    None,
    /// The expected upstream output is missing; search starts from zero.
    Zero,
    /// Output of the coarser HME level.
    Hme(ScaleFactor),
    /// Application-supplied motion vectors.
    External,
}

/// Macroblock dependency pattern for the software scoreboard.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScoreboardPattern {
    /// Left and top neighbours (I pictures, temporal-direct B).
    Degree45,
    /// Left, top and top-right neighbours (P pictures, spatial-direct B).
    Degree26,
}

/// A stage selected for this frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedStage {
    pub id: StageId,
    pub key: KernelKey,
    pub predictor: MvPredictor,
    /// Last stage of the frame; the sink flushes and submits after it.
    pub is_final: bool,
}

/// A recoverable gap in the stage graph (an upstream output that was missing).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamGap {
    pub stage: StageId,
    pub missing: String,
}

/// Ordered stage list for one frame.
#[derive(Clone, Debug)]
pub struct StagePlan {
    pub frame: FrameNumber,
    pub stages: Vec<PlannedStage>,
    pub scoreboard: ScoreboardPattern,
    pub gaps: Vec<UpstreamGap>,
}

impl StagePlan {
    pub fn contains(&self, id: StageId) -> bool {
        self.stages.iter().any(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    pub fn find(&self, id: StageId) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Descriptor slots the whole plan binds.
    pub fn descriptor_slots(&self) -> u32 {
        self.stages.iter().map(|s| s.id.kind().descriptor_slots()).sum()
    }
}

/// Immutable per-stage description, built once the kernel binaries are loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub key: KernelKey,
    pub block_size: usize,
    pub descriptor_slots: u32,
    pub kernel_offset: u32,
    pub kernel_size: u32,
}
