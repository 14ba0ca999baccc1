//! Stage graph orchestrator -- decides which kernel stages run for a frame.
//!
//! Selection is table-driven: [`STAGE_RULES`] lists every stage kind in
//! dispatch order together with the coding types it applies to and the
//! frame flags it requires or forbids. Kinds that run more than once per
//! frame are then expanded:
//!
//! ```text
//! brc_init_reset          (BRC, pending Init/Reset)
//! scale 4x -> 16x -> 32x  (first field, levels missing from the downscale cache)
//! me 32x -> 16x -> 4x     (P/B, HME; each level predicts the next finer one)
//! sw_scoreboard           (capability)
//! brc_i_frame_dist        (I, BRC + distortion)
//! brc_frame_update        (BRC)
//! brc_mb_update           (BRC + MB BRC or ROI)
//! weighted_pred L0/L1     (explicit weights, per flagged reference under the cap)
//! mbenc                   (always, final)
//! ```
//!
//! A missing upstream output (a reference without the downscaled surface a
//! motion search level needs, or an absent external MV buffer) never fails
//! the frame: the level is skipped, the next consumer gets a zero predictor
//! and the gap is logged and reported in [`StagePlan::gaps`].

use tracing::{debug, warn};

use kp_common::config::{EncoderCaps, FeatureFlags, HwGeneration, KernelMode, SequenceParams};
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::kernel::{BrcKernel, KernelKey, KernelOperation};
use kp_common::types::{PictureCodingType, RefList, ScaleFactor};

use crate::derive::{mbenc_kernel_key, scoreboard_pattern};
use crate::downscale::DownscaleCache;
use crate::frame::FrameContext;
use crate::stage::{MvPredictor, PlannedStage, StageId, StageKind, StagePlan, UpstreamGap};

/// Maximum references per list accepted from the application.
pub const MAX_REFS_PER_LIST: usize = 32;

/// Rate-control setup the model still has to push to the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BrcPending {
    #[default]
    None,
    Init,
    Reset,
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

const TYPE_I: u8 = 1 << 1;
const TYPE_P: u8 = 1 << 2;
const TYPE_B: u8 = 1 << 3;
const TYPE_ALL: u8 = TYPE_I | TYPE_P | TYPE_B;

const FLAG_BRC: u32 = 1 << 0;
const FLAG_BRC_PENDING: u32 = 1 << 1;
const FLAG_FIRST_FIELD: u32 = 1 << 2;
const FLAG_HME: u32 = 1 << 3;
const FLAG_EXTERNAL_MV: u32 = 1 << 4;
const FLAG_SW_SCOREBOARD: u32 = 1 << 5;
const FLAG_BRC_DISTORTION: u32 = 1 << 6;
const FLAG_MB_BRC: u32 = 1 << 7;
const FLAG_WEIGHTED_PRED: u32 = 1 << 8;

#[derive(Debug)]
struct StageRule {
    kind: StageKind,
    coding_types: u8,
    requires: u32,
    forbids: u32,
}

impl StageRule {
    fn applies(&self, coding_type: PictureCodingType, flags: u32) -> bool {
        self.coding_types & (1 << coding_type.raw()) != 0
            && flags & self.requires == self.requires
            && flags & self.forbids == 0
    }
}

/// Stage kinds in dispatch order with their selection conditions.
static STAGE_RULES: [StageRule; 9] = [
    StageRule {
        kind: StageKind::BrcInitReset,
        coding_types: TYPE_ALL,
        requires: FLAG_BRC | FLAG_BRC_PENDING,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::Scale,
        coding_types: TYPE_ALL,
        requires: FLAG_HME | FLAG_FIRST_FIELD,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::Me,
        coding_types: TYPE_P | TYPE_B,
        requires: FLAG_HME,
        forbids: FLAG_EXTERNAL_MV,
    },
    StageRule {
        kind: StageKind::SwScoreboard,
        coding_types: TYPE_ALL,
        requires: FLAG_SW_SCOREBOARD,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::BrcIFrameDist,
        coding_types: TYPE_I,
        requires: FLAG_BRC | FLAG_BRC_DISTORTION,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::BrcFrameUpdate,
        coding_types: TYPE_ALL,
        requires: FLAG_BRC,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::BrcMbUpdate,
        coding_types: TYPE_ALL,
        requires: FLAG_BRC | FLAG_MB_BRC,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::WeightedPred,
        coding_types: TYPE_P | TYPE_B,
        requires: FLAG_WEIGHTED_PRED,
        forbids: 0,
    },
    StageRule {
        kind: StageKind::MbEnc,
        coding_types: TYPE_ALL,
        requires: 0,
        forbids: 0,
    },
];

// ---------------------------------------------------------------------------
// StageGraph
// ---------------------------------------------------------------------------

/// Per-sequence orchestrator, parameterized by the capability table.
#[derive(Clone, Debug)]
pub struct StageGraph {
    caps: EncoderCaps,
    features: FeatureFlags,
    brc_enabled: bool,
    kernel_mode: KernelMode,
}

impl StageGraph {
    pub fn new(caps: &EncoderCaps, features: &FeatureFlags, sequence: &SequenceParams) -> Self {
        Self {
            caps: caps.clone(),
            features: features.clone(),
            brc_enabled: sequence.rc_mode.is_brc(),
            kernel_mode: KernelMode::from_target_usage(sequence.target_usage),
        }
    }

    /// Rebuild after a sequence parameter change.
    pub fn reconfigure(&mut self, sequence: &SequenceParams) {
        self.brc_enabled = sequence.rc_mode.is_brc();
        self.kernel_mode = KernelMode::from_target_usage(sequence.target_usage);
    }

    pub fn features(&self) -> &FeatureFlags {
        &self.features
    }

    pub fn caps(&self) -> &EncoderCaps {
        &self.caps
    }

    pub fn brc_enabled(&self) -> bool {
        self.brc_enabled
    }

    /// Enabled hierarchical ME levels, coarse to fine.
    pub fn hme_levels(&self) -> Vec<ScaleFactor> {
        if !self.features.hme {
            return Vec::new();
        }
        let use_16x = self.features.hme_16x && self.caps.hme_16x_supported;
        let use_32x = use_16x && self.features.hme_32x && self.caps.hme_32x_supported;

        let mut levels = Vec::with_capacity(3);
        if use_32x {
            levels.push(ScaleFactor::X32);
        }
        if use_16x {
            levels.push(ScaleFactor::X16);
        }
        levels.push(ScaleFactor::X4);
        levels
    }

    /// Produce the ordered stage list for one frame.
    ///
    /// Fails with `InvalidParameter` when the reference lists do not fit the
    /// coding type. Nothing is dispatched here.
    pub fn plan(
        &self,
        ctx: &FrameContext,
        cache: &mut DownscaleCache,
        brc: BrcPending,
    ) -> PipelineResult<StagePlan> {
        validate_references(ctx)?;

        let mut gaps = Vec::new();
        let flags = self.frame_flags(ctx, brc, &mut gaps);
        let levels = self.hme_levels();
        let mut stages: Vec<PlannedStage> = Vec::new();

        for rule in STAGE_RULES.iter() {
            if !rule.applies(ctx.coding_type, flags) {
                continue;
            }
            match rule.kind {
                StageKind::BrcInitReset => {
                    let kernel = if brc == BrcPending::Reset {
                        BrcKernel::Reset
                    } else {
                        BrcKernel::InitReset
                    };
                    stages.push(stage(StageId::BrcInitReset, KernelKey::brc(kernel)));
                }
                StageKind::Scale => {
                    // Finer levels first: 16x is produced from 4x, 32x from 16x.
                    let mut wanted = levels.clone();
                    wanted.reverse();
                    for level in cache.missing_levels(&ctx.current, &wanted) {
                        let variant = if level == ScaleFactor::X32 { 1 } else { 0 };
                        stages.push(stage(
                            StageId::Scale(level),
                            KernelKey::new(KernelOperation::Scaling, variant),
                        ));
                    }
                }
                StageKind::Me => self.expand_me(ctx, cache, &levels, &mut stages, &mut gaps),
                StageKind::SwScoreboard => stages.push(stage(
                    StageId::SwScoreboard,
                    KernelKey::new(KernelOperation::SwScoreboard, 0),
                )),
                StageKind::BrcIFrameDist => stages.push(stage(
                    StageId::BrcIFrameDist,
                    KernelKey::brc(BrcKernel::IFrameDistortion),
                )),
                StageKind::BrcFrameUpdate => stages.push(stage(
                    StageId::BrcFrameUpdate,
                    KernelKey::brc(BrcKernel::FrameUpdate),
                )),
                StageKind::BrcMbUpdate => stages.push(stage(
                    StageId::BrcMbUpdate,
                    KernelKey::brc(BrcKernel::MbUpdate),
                )),
                StageKind::WeightedPred => self.expand_weighted_pred(ctx, &mut stages),
                StageKind::MbEnc => {
                    let predictor = self.mbenc_predictor(flags, &levels, &stages, ctx);
                    let key = mbenc_kernel_key(
                        self.caps.advanced_mbenc,
                        self.kernel_mode,
                        ctx.coding_type,
                    );
                    stages.push(PlannedStage {
                        predictor,
                        ..stage(StageId::MbEnc, key)
                    });
                }
            }
        }

        if let Some(last) = stages.last_mut() {
            last.is_final = true;
        }

        let plan = StagePlan {
            frame: ctx.frame,
            stages,
            scoreboard: scoreboard_pattern(ctx.coding_type, ctx.direct_spatial),
            gaps,
        };

        debug!(
            frame = ctx.frame.0,
            coding_type = %ctx.coding_type,
            stages = plan.stages.len(),
            gaps = plan.gaps.len(),
            "Planned frame stages"
        );

        Ok(plan)
    }

    fn frame_flags(&self, ctx: &FrameContext, brc: BrcPending, gaps: &mut Vec<UpstreamGap>) -> u32 {
        let mut flags = 0;
        if self.brc_enabled {
            flags |= FLAG_BRC;
            if brc != BrcPending::None {
                flags |= FLAG_BRC_PENDING;
            }
            let roi_under_brc =
                self.features.roi && self.caps.brc_roi_supported && !ctx.roi.is_empty();
            if (self.features.mb_brc && self.caps.mb_brc_supported) || roi_under_brc {
                flags |= FLAG_MB_BRC;
            }
            if self.features.brc_distortion {
                flags |= FLAG_BRC_DISTORTION;
            }
        }
        if ctx.first_field {
            flags |= FLAG_FIRST_FIELD;
        }
        if self.features.hme {
            flags |= FLAG_HME;
        }
        if self.features.external_mv_input && !ctx.coding_type.is_intra() {
            if ctx.surfaces.external_mv.is_some() {
                flags |= FLAG_EXTERNAL_MV;
            } else {
                let gap = UpstreamGap {
                    stage: StageId::MbEnc,
                    missing: "external motion vector buffer".into(),
                };
                warn!(
                    frame = ctx.frame.0,
                    error = %upstream_error(&gap),
                    "External MV input enabled but no buffer supplied; using internal search"
                );
                gaps.push(gap);
            }
        }
        if self.caps.generation == HwGeneration::Gen12 {
            flags |= FLAG_SW_SCOREBOARD;
        }
        if self.features.weighted_prediction && ctx.weights.active_for(ctx.coding_type) {
            flags |= FLAG_WEIGHTED_PRED;
        }
        flags
    }

    fn expand_me(
        &self,
        ctx: &FrameContext,
        cache: &DownscaleCache,
        levels: &[ScaleFactor],
        stages: &mut Vec<PlannedStage>,
        gaps: &mut Vec<UpstreamGap>,
    ) {
        let variant = if ctx.coding_type == PictureCodingType::B { 1 } else { 0 };
        // (level, whether it ran) of the previous, coarser level.
        let mut coarser: Option<(ScaleFactor, bool)> = None;

        for &level in levels {
            let missing_ref = ctx
                .active_references()
                .find(|r| !cache.has_level(r, level));
            if let Some(reference) = missing_ref {
                let gap = UpstreamGap {
                    stage: StageId::Me(level),
                    missing: format!(
                        "{level} surface of reference picture {} (version {})",
                        reference.id.0, reference.version
                    ),
                };
                warn!(
                    frame = ctx.frame.0,
                    error = %upstream_error(&gap),
                    "Skipping motion search level"
                );
                gaps.push(gap);
                coarser = Some((level, false));
                continue;
            }

            let predictor = match coarser {
                None => MvPredictor::None,
                Some((prev, true)) => MvPredictor::Hme(prev),
                Some((_, false)) => MvPredictor::Zero,
            };
            stages.push(PlannedStage {
                predictor,
                ..stage(StageId::Me(level), KernelKey::new(KernelOperation::Me, variant))
            });
            coarser = Some((level, true));
        }
    }

    fn expand_weighted_pred(&self, ctx: &FrameContext, stages: &mut Vec<PlannedStage>) {
        let mut lists = vec![(RefList::L0, self.caps.max_weighted_l0)];
        if ctx.coding_type == PictureCodingType::B {
            lists.push((RefList::L1, self.caps.max_weighted_l1));
        }
        for (list, cap) in lists {
            let count = ctx.references(list).len().min(cap);
            for index in 0..count {
                if ctx.weights.weight_flag(list, index) {
                    stages.push(stage(
                        StageId::WeightedPred(list, index as u8),
                        KernelKey::new(KernelOperation::WeightedPrediction, 0),
                    ));
                }
            }
        }
    }

    fn mbenc_predictor(
        &self,
        flags: u32,
        levels: &[ScaleFactor],
        stages: &[PlannedStage],
        ctx: &FrameContext,
    ) -> MvPredictor {
        if ctx.coding_type.is_intra() {
            return MvPredictor::None;
        }
        if flags & FLAG_EXTERNAL_MV != 0 {
            return MvPredictor::External;
        }
        if levels.is_empty() {
            return MvPredictor::None;
        }
        if stages.iter().any(|s| s.id == StageId::Me(ScaleFactor::X4)) {
            MvPredictor::Hme(ScaleFactor::X4)
        } else {
            MvPredictor::Zero
        }
    }
}

fn stage(id: StageId, key: KernelKey) -> PlannedStage {
    PlannedStage {
        id,
        key,
        predictor: MvPredictor::None,
        is_final: false,
    }
}

fn upstream_error(gap: &UpstreamGap) -> PipelineError {
    PipelineError::UpstreamUnavailable {
        stage: gap.stage.to_string(),
        missing: gap.missing.clone(),
    }
}

fn validate_references(ctx: &FrameContext) -> PipelineResult<()> {
    if ctx.l0.len() > MAX_REFS_PER_LIST || ctx.l1.len() > MAX_REFS_PER_LIST {
        return Err(PipelineError::invalid(format!(
            "reference lists too long: L0={} L1={}",
            ctx.l0.len(),
            ctx.l1.len()
        )));
    }
    match ctx.coding_type {
        PictureCodingType::P if ctx.l0.is_empty() => Err(PipelineError::invalid(
            "P picture without L0 references",
        )),
        PictureCodingType::B if ctx.l0.is_empty() || ctx.l1.is_empty() => {
            Err(PipelineError::invalid(
                "B picture needs both L0 and L1 references",
            ))
        }
        _ => Ok(()),
    }
}
