//! Encode pipeline -- ties planning, resources, derivation and rate control
//! together and drives one frame at a time into the command sink.
//!
//! ```text
//! encode_frame(ctx, input)
//!   |
//!   +-- plan_frame            stage list for this frame (graph + downscale cache)
//!   +-- resolve_regions       ROI / dirty rectangles
//!   +-- rc.clone().update     BRC values, on a copy of the model
//!   +-- request_space         descriptor heap for the whole plan
//!   +-- per stage:            acquire block -> derive -> pack -> bind
//!   |      (any error: abandon every block, release the heap, model untouched)
//!   +-- submit in plan order  command sink returns completion tags
//!   +-- commit                model copy, downscale cache, recycle index
//!
//! complete_frame(stats)       MbEnc statistics back into the model
//! mark_complete(tag)          device consumed everything tagged `tag`
//! ```

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kp_common::config::{PipelineConfig, SequenceParams};
use kp_common::device::{
    Binding, CommandRecord, CommandSink, CompletionTag, DescriptorHeap, DispatchRequest,
    KernelBinaryProvider, RECORD_FLAG_FINAL,
};
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::types::{FrameNumber, PictureCodingType, PictureStructure, RecycleIndex, RefList, Resolution, ScaleFactor};

use crate::brc::{BrcUpdateOutput, RateControlModel, RcState};
use crate::derive::{
    cap_window_for_b, clip_roi_delta, init_brc_constant_data, mb_const_data_in_use, mode_costs,
    resolve_regions, roi_ratio, search_path, search_window, skip_threshold, slice_qp, ExplicitWindow,
    RegionSelection, SearchSettings,
};
use crate::downscale::{CacheStats, DownscaleCache};
use crate::frame::{BrcFrameInput, FrameContext, FrameStatistics};
use crate::graph::{BrcPending, StageGraph};
use crate::kernels::KernelSet;
use crate::layout::{
    BrcInitResetParams, IFrameDistParams, MbBrcUpdateParams, MbEncParams, MeParams, ScaleParams,
    StageParameters, SwScoreboardParams, WeightedPredParams,
};
use crate::recycle::RecycledBuffer;
use crate::resources::{
    bind_stage_resources, BindingContext, HeapReservation, ParameterBlock, ResourceManager, MBENC_REFS_PER_LIST,
    ME_REFS_L0, ME_REFS_L1,
};
use crate::stage::{PlannedStage, StageDescriptor, StageId, StagePlan, UpstreamGap};
use crate::tables::BRC_CONSTANT_DATA_SIZE;

/// Pictures whose downscaled copies are remembered.
pub const DOWNSCALE_CACHE_CAPACITY: usize = 32;

/// Parameter blocks are placed in the dynamic state region at this alignment.
const PARAMETER_ALIGNMENT: u32 = 64;

// ---------------------------------------------------------------------------
// Reports and statistics
// ---------------------------------------------------------------------------

/// What `encode_frame` dispatched.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub frame: FrameNumber,
    pub stages: Vec<StageId>,
    /// Completion tag of each dispatched stage, in plan order.
    pub tags: Vec<CompletionTag>,
    /// Upstream outputs that were missing and worked around.
    pub gaps: Vec<UpstreamGap>,
    pub brc: Option<BrcUpdateOutput>,
    pub recycle_index: RecycleIndex,
}

impl FrameReport {
    /// Tag of the final stage; the frame is done once it completes.
    pub fn final_tag(&self) -> Option<CompletionTag> {
        self.tags.last().copied()
    }
}

/// Running pipeline statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_encoded: u64,
    /// Frames abandoned after their descriptor space was reserved.
    pub frames_aborted: u64,
    pub stages_dispatched: u64,
    pub parameter_bytes: u64,
    pub upstream_gaps: u64,
    /// Bits reported back through `complete_frame`.
    pub bits_produced: u64,
}

/// One stage ready for the sink.
#[derive(Debug)]
struct PreparedStage {
    planned: PlannedStage,
    descriptor: StageDescriptor,
    block: ParameterBlock,
    table: Option<RecycledBuffer>,
    bindings: Vec<Binding>,
    packed: usize,
    /// Offset of the block in this frame's dynamic state region.
    parameter_offset: u32,
}

/// Per-frame values shared by the stage derivations.
#[derive(Debug)]
struct FrameDerivation<'a> {
    ctx: &'a FrameContext,
    plan: &'a StagePlan,
    regions: RegionSelection,
    brc: Option<&'a BrcUpdateOutput>,
    brc_pending: BrcPending,
    slice_qp: u8,
    search: SearchSettings,
    mb_const_data: bool,
}

// ---------------------------------------------------------------------------
// EncodePipeline
// ---------------------------------------------------------------------------

/// Per-sequence encode pipeline.
///
/// Owns the stage graph, the loaded kernels, the resource manager, the
/// downscale cache and the rate-control model. Frames are encoded one at a
/// time; completions may arrive from another thread through
/// [`EncodePipeline::completion_sender`].
pub struct EncodePipeline {
    config: PipelineConfig,
    graph: StageGraph,
    kernels: KernelSet,
    resources: ResourceManager,
    cache: DownscaleCache,
    rc: RateControlModel,
    sink: Box<dyn CommandSink>,
    search: SearchSettings,
    stats: PipelineStats,
}

impl std::fmt::Debug for EncodePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodePipeline")
            .field("resolution", &self.config.sequence.resolution)
            .field("rc_mode", &self.config.sequence.rc_mode)
            .field("rc_state", &self.rc.state())
            .field("kernels", &self.kernels)
            .field("resources", &self.resources)
            .field("cache_entries", &self.cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl EncodePipeline {
    /// Validate `config`, load every kernel family and initialize rate
    /// control when the sequence uses it.
    pub fn new(
        config: &PipelineConfig,
        sink: Box<dyn CommandSink>,
        provider: Arc<dyn KernelBinaryProvider>,
        heap: Box<dyn DescriptorHeap>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let kernels = KernelSet::new(provider, config.caps.generation);
        kernels.preload()?;
        let resources = ResourceManager::new(
            heap,
            kernels.layout(),
            config.caps.recycle_slots,
            Duration::from_millis(config.acquire_timeout_ms),
        )?;

        let mut rc = RateControlModel::new();
        if config.sequence.rc_mode.is_brc() {
            rc.init(&config.sequence)?;
        }
        let search = search_window(config.sequence.target_usage, None)?;

        info!(
            resolution = %config.sequence.resolution,
            rc_mode = ?config.sequence.rc_mode,
            generation = ?config.caps.generation,
            recycle_slots = config.caps.recycle_slots,
            "Encode pipeline created"
        );

        Ok(Self {
            graph: StageGraph::new(&config.caps, &config.features, &config.sequence),
            config: config.clone(),
            kernels,
            resources,
            cache: DownscaleCache::new(DOWNSCALE_CACHE_CAPACITY),
            rc,
            sink,
            search,
            stats: PipelineStats::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn rate_control(&self) -> &RateControlModel {
        &self.rc
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn recycle_index(&self) -> RecycleIndex {
        self.resources.recycle_index()
    }

    pub fn search_settings(&self) -> SearchSettings {
        self.search
    }

    /// Slots still owned by the device.
    pub fn in_flight(&self) -> usize {
        self.resources.in_flight()
    }

    pub fn heap_available(&self) -> u32 {
        self.resources.heap_available()
    }

    /// Sender a device thread can signal completions on.
    pub fn completion_sender(&self) -> Sender<CompletionTag> {
        self.resources.completion_sender()
    }

    /// Replace the target-usage search window with a preset (0 = explicit).
    pub fn set_search_window(&mut self, preset: u8, explicit: Option<ExplicitWindow>) -> PipelineResult<()> {
        self.search = search_window(preset, explicit)?;
        debug!(
            preset,
            width = self.search.window.width,
            height = self.search.window.height,
            me_method = self.search.me_method,
            "Search window updated"
        );
        Ok(())
    }

    /// Stage list for `ctx` without dispatching anything.
    pub fn plan_frame(&mut self, ctx: &FrameContext) -> PipelineResult<StagePlan> {
        self.ensure_open()?;
        let pending = if self.graph.brc_enabled() {
            self.rc.pending()
        } else {
            BrcPending::None
        };
        self.graph.plan(ctx, &mut self.cache, pending)
    }

    /// Plan, prepare and dispatch every stage of one frame.
    ///
    /// On `InvalidParameter`, `ResourceExhausted` or `CopyFailure` nothing
    /// is submitted and the rate-control model is unchanged.
    pub fn encode_frame(&mut self, ctx: &FrameContext, input: &BrcFrameInput) -> PipelineResult<FrameReport> {
        let plan = self.plan_frame(ctx)?;
        let brc_enabled = self.graph.brc_enabled();
        let features = self.graph.features().clone();
        let caps = self.graph.caps().clone();

        let mut regions = resolve_regions(ctx, &features, &caps, brc_enabled)?;
        let advanced_under_brc = caps.advanced_mbenc && brc_enabled;
        let qp = slice_qp(ctx, advanced_under_brc)?;
        if !brc_enabled {
            if let RegionSelection::Roi(rois) = &mut regions {
                for roi in rois.iter_mut() {
                    roi.qp_delta = clip_roi_delta(qp, roi.qp_delta);
                }
            }
        }

        let brc_pending = if brc_enabled { self.rc.pending() } else { BrcPending::None };
        let mut rc = self.rc.clone();
        let brc_output = if brc_enabled {
            Some(rc.update(ctx, input)?)
        } else {
            None
        };

        let window = cap_window_for_b(self.search.window, ctx.coding_type, features.disable_b_me);
        let derivation = FrameDerivation {
            ctx,
            plan: &plan,
            mb_const_data: mb_const_data_in_use(&features, &regions, brc_enabled),
            regions,
            brc: brc_output.as_ref(),
            brc_pending,
            slice_qp: qp,
            search: SearchSettings {
                window,
                me_method: self.search.me_method,
            },
        };

        let mut reservation = self.resources.request_space(&plan)?;
        let index = self.resources.recycle_index();
        let mut prepared: Vec<PreparedStage> = Vec::with_capacity(plan.stages.len());
        let mut offset = 0u32;

        for planned in &plan.stages {
            match self.prepare_stage(planned, &derivation, index, &mut reservation, offset) {
                Ok(stage) => {
                    offset += align_up(stage.packed as u32, PARAMETER_ALIGNMENT);
                    prepared.push(stage);
                }
                Err(e) => {
                    warn!(frame = ctx.frame.0, stage = %planned.id, error = %e, "Frame aborted before submission");
                    for stage in prepared {
                        self.abandon(stage);
                    }
                    self.resources.release_reservation(reservation);
                    self.stats.frames_aborted += 1;
                    return Err(e);
                }
            }
        }

        // Submit in plan order.
        let mut tags = Vec::with_capacity(prepared.len());
        let mut pending = prepared.into_iter();
        while let Some(stage) = pending.next() {
            let request = DispatchRequest {
                record: stage.record(),
                parameters: stage.block.bytes(),
                constant_data: stage.table.as_ref().map_or(&[][..], |t| &t.data[..]),
                bindings: &stage.bindings,
            };
            match self.sink.submit(&request) {
                Ok(tag) => {
                    self.stats.stages_dispatched += 1;
                    self.stats.parameter_bytes += stage.packed as u64;
                    tags.push(tag);
                    self.retire(stage, tag);
                }
                Err(e) => {
                    warn!(frame = ctx.frame.0, stage = %stage.planned.id, error = %e, "Command sink rejected stage");
                    self.abandon(stage);
                    for rest in pending {
                        self.abandon(rest);
                    }
                    match tags.last() {
                        Some(&tag) => self.resources.retire_reservation(reservation, tag),
                        None => self.resources.release_reservation(reservation),
                    }
                    self.stats.frames_aborted += 1;
                    return Err(e);
                }
            }
        }
        if let Some(&tag) = tags.last() {
            self.resources.retire_reservation(reservation, tag);
        } else {
            self.resources.release_reservation(reservation);
        }

        // Commit.
        if brc_enabled {
            self.rc = rc;
        }
        let scaled: Vec<ScaleFactor> = plan
            .stages
            .iter()
            .filter_map(|s| match s.id {
                StageId::Scale(level) => Some(level),
                _ => None,
            })
            .collect();
        if !scaled.is_empty() {
            self.cache.record(&ctx.current, &scaled, ctx.frame);
        }
        for reference in ctx.active_references() {
            self.cache.touch(reference, ctx.frame);
        }
        self.resources.advance();
        self.stats.frames_encoded += 1;
        self.stats.upstream_gaps += plan.gaps.len() as u64;

        info!(
            frame = ctx.frame.0,
            coding_type = %ctx.coding_type,
            stages = tags.len(),
            slot = %index,
            target_bits = brc_output.as_ref().map(|o| o.target_size),
            "Frame dispatched"
        );

        Ok(FrameReport {
            frame: ctx.frame,
            stages: plan.ids(),
            tags,
            gaps: plan.gaps,
            brc: brc_output,
            recycle_index: index,
        })
    }

    /// Feed the macroblock-encode statistics of a dispatched frame back into
    /// rate control. A no-op under constant QP.
    pub fn complete_frame(&mut self, stats: &FrameStatistics) -> PipelineResult<()> {
        self.ensure_open()?;
        self.stats.bits_produced += stats.bits_produced;
        if self.graph.brc_enabled() {
            self.rc.record_statistics(stats)?;
        }
        Ok(())
    }

    /// The device consumed everything dispatched under `tag`.
    pub fn mark_complete(&mut self, tag: CompletionTag) {
        self.resources.mark_complete(tag);
    }

    /// Apply completions that arrived over the channel.
    pub fn poll_completions(&mut self) {
        self.resources.reclaim();
    }

    /// Apply new sequence parameters (rate-control Reset).
    pub fn reconfigure(&mut self, sequence: &SequenceParams) -> PipelineResult<()> {
        self.ensure_open()?;
        sequence.validate()?;

        if sequence.rc_mode.is_brc() {
            if self.rc.state() == RcState::Uninitialized {
                self.rc.init(sequence)?;
            } else {
                self.rc.reset(sequence)?;
            }
        } else if self.rc.state() != RcState::Uninitialized {
            self.rc.teardown();
            self.rc = RateControlModel::new();
        }
        self.graph.reconfigure(sequence);
        self.search = search_window(sequence.target_usage, None)?;
        self.config.sequence = sequence.clone();

        info!(
            rc_mode = ?sequence.rc_mode,
            target_bitrate = sequence.target_bitrate,
            "Encode pipeline reconfigured"
        );
        Ok(())
    }

    /// End the sequence. Every later frame operation fails.
    pub fn teardown(&mut self) {
        self.rc.teardown();
        info!(
            frames = self.stats.frames_encoded,
            aborted = self.stats.frames_aborted,
            stages = self.stats.stages_dispatched,
            "Encode pipeline torn down"
        );
    }

    fn ensure_open(&self) -> PipelineResult<()> {
        if self.rc.state() == RcState::Torndown {
            return Err(PipelineError::invalid("encode pipeline has been torn down"));
        }
        Ok(())
    }

    fn prepare_stage(
        &mut self,
        planned: &PlannedStage,
        d: &FrameDerivation<'_>,
        index: RecycleIndex,
        reservation: &mut HeapReservation,
        parameter_offset: u32,
    ) -> PipelineResult<PreparedStage> {
        let descriptor = self.kernels.descriptor(planned.id.kind(), planned.key)?;
        let params = self.stage_parameters(planned, d)?;

        let mut block = self.resources.acquire_block(planned.id, index, reservation)?;
        let packed = match self.kernels.layout().pack(&params, block.bytes_mut()) {
            Ok(n) => n,
            Err(e) => {
                self.resources.abandon_block(block);
                return Err(e);
            }
        };

        let table = if planned.id == StageId::BrcFrameUpdate {
            let mut table = match self.resources.acquire_table(planned.id, index, BRC_CONSTANT_DATA_SIZE) {
                Ok(t) => t,
                Err(e) => {
                    self.resources.abandon_block(block);
                    return Err(e);
                }
            };
            if let Err(e) = init_brc_constant_data(d.ctx.coding_type, &mut table.data) {
                self.resources.abandon_table(table);
                self.resources.abandon_block(block);
                return Err(e);
            }
            Some(table)
        } else {
            None
        };

        let binding_ctx = BindingContext {
            ctx: d.ctx,
            features: self.graph.features(),
            caps: self.graph.caps(),
            brc_enabled: self.graph.brc_enabled(),
            mb_const_data: d.mb_const_data,
        };
        let bindings = bind_stage_resources(planned, &binding_ctx)
            .and_then(|table| table.bindings(block.descriptors()));
        let bindings = match bindings {
            Ok(b) => b,
            Err(e) => {
                if let Some(table) = table {
                    self.resources.abandon_table(table);
                }
                self.resources.abandon_block(block);
                return Err(e);
            }
        };

        Ok(PreparedStage {
            planned: planned.clone(),
            descriptor,
            block,
            table,
            bindings,
            packed,
            parameter_offset,
        })
    }

    fn stage_parameters(&self, planned: &PlannedStage, d: &FrameDerivation<'_>) -> PipelineResult<StageParameters> {
        let ctx = d.ctx;
        let resolution = self.config.sequence.resolution;
        let (width_in_mbs, height_in_mbs) = picture_mbs(resolution, ctx.structure);

        let params = match planned.id {
            StageId::BrcInitReset => StageParameters::BrcInitReset(BrcInitResetParams {
                settings: self.rc.settings()?.clone(),
                reset: d.brc_pending == BrcPending::Reset,
            }),
            StageId::Scale(level) => {
                let input = match level {
                    ScaleFactor::X4 => resolution,
                    ScaleFactor::X16 => resolution.downscaled(ScaleFactor::X4.factor()),
                    ScaleFactor::X32 => resolution.downscaled(ScaleFactor::X16.factor()),
                };
                StageParameters::Scale(ScaleParams {
                    input_width: input.width,
                    input_height: input.height,
                    factor: level,
                    structure: ctx.structure,
                })
            }
            StageId::Me(level) => {
                let scaled = resolution.downscaled(level.factor());
                StageParameters::Me(MeParams {
                    level,
                    coding_type: ctx.coding_type,
                    width_in_mbs: scaled.width_in_mbs(),
                    height_in_mbs: scaled.height_in_mbs(),
                    predictor: planned.predictor,
                    num_refs_l0: ref_count(ctx, RefList::L0, ME_REFS_L0),
                    num_refs_l1: ref_count(ctx, RefList::L1, ME_REFS_L1),
                    search: d.search,
                    search_path: *search_path(ctx.coding_type, d.search.me_method),
                    qp: d.slice_qp,
                })
            }
            StageId::SwScoreboard => StageParameters::SwScoreboard(SwScoreboardParams {
                pattern: d.plan.scoreboard,
                width_in_mbs,
                height_in_mbs,
            }),
            StageId::BrcIFrameDist => {
                let scaled = resolution.downscaled(ScaleFactor::X4.factor());
                StageParameters::BrcIFrameDist(IFrameDistParams {
                    width_in_mbs: scaled.width_in_mbs(),
                    height_in_mbs: scaled.height_in_mbs(),
                })
            }
            StageId::BrcFrameUpdate => {
                let output = d
                    .brc
                    .ok_or_else(|| PipelineError::invalid("frame update planned without rate control"))?;
                StageParameters::BrcFrameUpdate(output.clone())
            }
            StageId::BrcMbUpdate => {
                let (roi_enabled, ratio) = match &d.regions {
                    RegionSelection::Roi(rois) => (true, roi_ratio(width_in_mbs * height_in_mbs, rois)),
                    _ => (false, 0),
                };
                StageParameters::BrcMbUpdate(MbBrcUpdateParams {
                    width_in_mbs,
                    height_in_mbs,
                    roi_enabled,
                    roi_ratio: ratio,
                    intra_refresh: d.brc.and_then(|o| o.intra_refresh),
                })
            }
            StageId::WeightedPred(list, ref_index) => {
                StageParameters::WeightedPred(WeightedPredParams { list, ref_index })
            }
            StageId::MbEnc => StageParameters::MbEnc(MbEncParams {
                coding_type: ctx.coding_type,
                structure: ctx.structure,
                width_in_mbs,
                height_in_mbs,
                slice_qp: d.slice_qp,
                costs: mode_costs(ctx.coding_type, d.slice_qp),
                skip_threshold: skip_threshold(ctx.coding_type, d.slice_qp),
                search: d.search,
                search_path: *search_path(ctx.coding_type, d.search.me_method),
                predictor: planned.predictor,
                num_refs_l0: ref_count(ctx, RefList::L0, MBENC_REFS_PER_LIST),
                num_refs_l1: ref_count(ctx, RefList::L1, MBENC_REFS_PER_LIST),
                direct_spatial: ctx.direct_spatial,
                mb_const_data: d.mb_const_data,
                mb_brc: d.plan.contains(StageId::BrcMbUpdate),
                advanced: self.graph.caps().advanced_mbenc,
                regions: d.regions.clone(),
                scoreboard: d.plan.scoreboard,
            }),
        };
        Ok(params)
    }

    fn retire(&mut self, stage: PreparedStage, tag: CompletionTag) {
        if let Some(table) = stage.table {
            self.resources.retire_table(table, tag);
        }
        self.resources.retire_block(stage.block, tag);
    }

    fn abandon(&mut self, stage: PreparedStage) {
        if let Some(table) = stage.table {
            self.resources.abandon_table(table);
        }
        self.resources.abandon_block(stage.block);
    }
}

impl PreparedStage {
    fn record(&self) -> CommandRecord {
        CommandRecord {
            opcode: self.descriptor.kind.opcode(),
            variant: self.descriptor.key.variant as u16,
            kernel_offset: self.descriptor.kernel_offset,
            kernel_size: self.descriptor.kernel_size,
            parameter_offset: self.parameter_offset,
            parameter_size: self.packed as u32,
            binding_count: self.bindings.len() as u16,
            flags: if self.planned.is_final { RECORD_FLAG_FINAL } else { 0 },
        }
    }
}

/// Macroblock dimensions of one picture; fields hold half the rows.
fn picture_mbs(resolution: Resolution, structure: PictureStructure) -> (u32, u32) {
    let width = resolution.width_in_mbs();
    let height = resolution.height_in_mbs();
    if structure.is_field() {
        (width, height.div_ceil(2))
    } else {
        (width, height)
    }
}

/// References of `list` a stage uses, capped at `limit`.
fn ref_count(ctx: &FrameContext, list: RefList, limit: usize) -> u8 {
    let in_use = match list {
        RefList::L0 => !ctx.coding_type.is_intra(),
        RefList::L1 => ctx.coding_type == PictureCodingType::B,
    };
    if in_use {
        ctx.references(list).len().min(limit) as u8
    } else {
        0
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}
