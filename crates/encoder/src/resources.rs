//! Resource & parameter block management.
//!
//! Per frame the pipeline reserves descriptor-heap space for the whole plan,
//! then for each stage checks a parameter block out of the recycled set,
//! carves the stage's descriptor slots out of the reservation and builds a
//! [`ResourceDescriptorTable`] mapping logical roles to surfaces.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{debug, warn};

use kp_common::config::{EncoderCaps, FeatureFlags};
use kp_common::device::{Binding, CompletionTag, DescriptorHeap, HeapRange, SurfaceHandle};
use kp_common::error::{ExhaustedResource, PipelineError, PipelineResult};
use kp_common::types::{PictureCodingType, RecycleIndex, RefList, ScaleFactor};

use crate::frame::FrameContext;
use crate::layout::ParameterBlockLayout;
use crate::recycle::{BufferKind, RecycledBuffer, RecycledBufferSet};
use crate::stage::{MvPredictor, PlannedStage, StageId, StagePlan};

/// References the macroblock-encode stage binds per list.
pub const MBENC_REFS_PER_LIST: usize = 16;
/// References a motion search stage binds from L0 / L1.
pub const ME_REFS_L0: usize = 4;
pub const ME_REFS_L1: usize = 2;

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

/// Logical resource a stage binds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceRole {
    CurrentPicture,
    CurrentScaled(ScaleFactor),
    Reconstructed,
    Reference(RefList, u8),
    MvOutput(ScaleFactor),
    MvPredictor,
    MeDistortion,
    MbCode,
    MvData,
    BrcHistory,
    BrcDistortion,
    BrcImageState,
    PakStatistics,
    MbQp,
    WeightedOutput,
}

/// Ordered role → surface mapping for one dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceDescriptorTable {
    entries: BTreeMap<ResourceRole, SurfaceHandle>,
}

impl ResourceDescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, role: ResourceRole) -> Option<SurfaceHandle> {
        self.entries.get(&role).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Heap bindings for the table, in role order, starting at `range.offset`.
    pub fn bindings(&self, range: HeapRange) -> PipelineResult<Vec<Binding>> {
        let needed = self.entries.len() as u32;
        if needed > range.len {
            return Err(ExhaustedResource::Reservation {
                needed,
                remaining: range.len,
            }
            .into());
        }
        Ok(self
            .entries
            .values()
            .enumerate()
            .map(|(i, handle)| Binding {
                slot: range.offset + i as u32,
                handle: *handle,
            })
            .collect())
    }
}

/// Bind `handle` to `role`; a later bind of the same role replaces it.
pub fn bind_resource(table: &mut ResourceDescriptorTable, role: ResourceRole, handle: SurfaceHandle) {
    table.entries.insert(role, handle);
}

/// Whether explicit weighting applies to `list` for this frame.
pub fn weighted_list_enabled(ctx: &FrameContext, features: &FeatureFlags, list: RefList) -> bool {
    let list_in_use = match list {
        RefList::L0 => !ctx.coding_type.is_intra(),
        RefList::L1 => ctx.coding_type == PictureCodingType::B,
    };
    features.weighted_prediction && list_in_use && ctx.weights.active_for(ctx.coding_type)
}

/// Surface to bind for reference `index` of `list`.
///
/// The weighted-prediction output wins iff weighting is enabled for the
/// list, the reference's weight flag is set and the index is under the
/// list's cap. Otherwise the raw reference picture is bound.
pub fn reference_surface(
    ctx: &FrameContext,
    features: &FeatureFlags,
    caps: &EncoderCaps,
    list: RefList,
    index: usize,
) -> Option<SurfaceHandle> {
    let reference = ctx.references(list).get(index)?;
    let cap = match list {
        RefList::L0 => caps.max_weighted_l0,
        RefList::L1 => caps.max_weighted_l1,
    };
    let weighted = weighted_list_enabled(ctx, features, list)
        && ctx.weights.weight_flag(list, index)
        && index < cap;
    if weighted {
        if let Some(surface) = ctx.surfaces.weighted(list, index) {
            return Some(surface);
        }
        warn!(
            frame = ctx.frame.0,
            list = %list,
            index,
            "Weighted output surface missing; binding raw reference"
        );
    }
    Some(reference.surfaces.raw)
}

/// Bind up to `limit` references of `list` at full resolution.
pub fn bind_reference_list(
    table: &mut ResourceDescriptorTable,
    ctx: &FrameContext,
    features: &FeatureFlags,
    caps: &EncoderCaps,
    list: RefList,
    limit: usize,
) {
    let count = ctx.references(list).len().min(limit);
    for index in 0..count {
        if let Some(surface) = reference_surface(ctx, features, caps, list, index) {
            bind_resource(table, ResourceRole::Reference(list, index as u8), surface);
        }
    }
}

/// Context a stage's resource table is built from.
#[derive(Clone, Copy, Debug)]
pub struct BindingContext<'a> {
    pub ctx: &'a FrameContext,
    pub features: &'a FeatureFlags,
    pub caps: &'a EncoderCaps,
    pub brc_enabled: bool,
    pub mb_const_data: bool,
}

/// Build the descriptor table for one planned stage.
pub fn bind_stage_resources(stage: &PlannedStage, b: &BindingContext<'_>) -> PipelineResult<ResourceDescriptorTable> {
    let ctx = b.ctx;
    let s = &ctx.surfaces;
    let mut table = ResourceDescriptorTable::new();

    match stage.id {
        StageId::BrcInitReset => {
            bind_resource(&mut table, ResourceRole::BrcHistory, s.brc_history);
            bind_resource(&mut table, ResourceRole::BrcDistortion, s.brc_distortion);
        }
        StageId::Scale(level) => {
            let (role, input) = match level {
                ScaleFactor::X4 => (ResourceRole::CurrentPicture, ctx.current.surfaces.raw),
                ScaleFactor::X16 => (
                    ResourceRole::CurrentScaled(ScaleFactor::X4),
                    ctx.current.surfaces.scaled_4x,
                ),
                ScaleFactor::X32 => (
                    ResourceRole::CurrentScaled(ScaleFactor::X16),
                    ctx.current.surfaces.scaled_16x,
                ),
            };
            bind_resource(&mut table, role, input);
            bind_resource(
                &mut table,
                ResourceRole::CurrentScaled(level),
                ctx.current.surfaces.scaled(level),
            );
        }
        StageId::Me(level) => {
            bind_resource(
                &mut table,
                ResourceRole::CurrentScaled(level),
                ctx.current.surfaces.scaled(level),
            );
            let lists: &[(RefList, usize)] = if ctx.coding_type == PictureCodingType::B {
                &[(RefList::L0, ME_REFS_L0), (RefList::L1, ME_REFS_L1)]
            } else {
                &[(RefList::L0, ME_REFS_L0)]
            };
            for &(list, limit) in lists {
                for (i, r) in ctx.references(list).iter().take(limit).enumerate() {
                    bind_resource(
                        &mut table,
                        ResourceRole::Reference(list, i as u8),
                        r.surfaces.scaled(level),
                    );
                }
            }
            bind_resource(&mut table, ResourceRole::MvOutput(level), s.me_mv(level));
            if let MvPredictor::Hme(coarser) = stage.predictor {
                bind_resource(&mut table, ResourceRole::MvPredictor, s.me_mv(coarser));
            }
            if level == ScaleFactor::X4 {
                bind_resource(&mut table, ResourceRole::MeDistortion, s.me_distortion);
                if b.brc_enabled {
                    bind_resource(&mut table, ResourceRole::BrcDistortion, s.brc_distortion);
                }
            }
        }
        StageId::SwScoreboard => {
            bind_resource(&mut table, ResourceRole::CurrentPicture, ctx.current.surfaces.raw);
            bind_resource(&mut table, ResourceRole::MbCode, s.mb_code);
        }
        StageId::BrcIFrameDist => {
            bind_resource(
                &mut table,
                ResourceRole::CurrentScaled(ScaleFactor::X4),
                ctx.current.surfaces.scaled_4x,
            );
            bind_resource(&mut table, ResourceRole::BrcDistortion, s.brc_distortion);
        }
        StageId::BrcFrameUpdate => {
            bind_resource(&mut table, ResourceRole::BrcHistory, s.brc_history);
            bind_resource(&mut table, ResourceRole::PakStatistics, s.pak_statistics);
            bind_resource(&mut table, ResourceRole::BrcImageState, s.brc_image_state);
            bind_resource(&mut table, ResourceRole::BrcDistortion, s.brc_distortion);
        }
        StageId::BrcMbUpdate => {
            bind_resource(&mut table, ResourceRole::BrcHistory, s.brc_history);
            bind_resource(&mut table, ResourceRole::BrcDistortion, s.brc_distortion);
            if let Some(mb_qp) = s.mb_qp {
                bind_resource(&mut table, ResourceRole::MbQp, mb_qp);
            }
        }
        StageId::WeightedPred(list, index) => {
            let index = usize::from(index);
            let reference = ctx.references(list).get(index).ok_or_else(|| {
                PipelineError::invalid(format!("weighted prediction for missing {list}[{index}]"))
            })?;
            let output = s.weighted(list, index).ok_or_else(|| {
                PipelineError::invalid(format!("no weighted output surface for {list}[{index}]"))
            })?;
            bind_resource(&mut table, ResourceRole::Reference(list, index as u8), reference.surfaces.raw);
            bind_resource(&mut table, ResourceRole::WeightedOutput, output);
        }
        StageId::MbEnc => {
            bind_resource(&mut table, ResourceRole::CurrentPicture, ctx.current.surfaces.raw);
            bind_resource(&mut table, ResourceRole::Reconstructed, ctx.recon);
            if !ctx.coding_type.is_intra() {
                bind_reference_list(&mut table, ctx, b.features, b.caps, RefList::L0, MBENC_REFS_PER_LIST);
            }
            if ctx.coding_type == PictureCodingType::B {
                bind_reference_list(&mut table, ctx, b.features, b.caps, RefList::L1, MBENC_REFS_PER_LIST);
            }
            bind_resource(&mut table, ResourceRole::MbCode, s.mb_code);
            bind_resource(&mut table, ResourceRole::MvData, s.mv_data);
            match stage.predictor {
                MvPredictor::Hme(level) => {
                    bind_resource(&mut table, ResourceRole::MvPredictor, s.me_mv(level));
                    bind_resource(&mut table, ResourceRole::MeDistortion, s.me_distortion);
                }
                MvPredictor::External => {
                    if let Some(mv) = s.external_mv {
                        bind_resource(&mut table, ResourceRole::MvPredictor, mv);
                    }
                }
                MvPredictor::None | MvPredictor::Zero => {}
            }
            if b.mb_const_data {
                if let Some(mb_qp) = s.mb_qp {
                    bind_resource(&mut table, ResourceRole::MbQp, mb_qp);
                }
            }
            bind_resource(&mut table, ResourceRole::PakStatistics, s.pak_statistics);
        }
    }

    Ok(table)
}

// ---------------------------------------------------------------------------
// Heap reservation
// ---------------------------------------------------------------------------

/// Descriptor-heap space reserved for one frame.
#[derive(Debug, PartialEq, Eq)]
pub struct HeapReservation {
    range: HeapRange,
    used: u32,
}

impl HeapReservation {
    pub fn range(&self) -> HeapRange {
        self.range
    }

    pub fn remaining(&self) -> u32 {
        self.range.len - self.used
    }

    /// Carve `slots` entries off the front of the unused space.
    pub fn take(&mut self, slots: u32) -> PipelineResult<HeapRange> {
        if slots > self.remaining() {
            return Err(ExhaustedResource::Reservation {
                needed: slots,
                remaining: self.remaining(),
            }
            .into());
        }
        let range = HeapRange {
            offset: self.range.offset + self.used,
            len: slots,
        };
        self.used += slots;
        Ok(range)
    }
}

// ---------------------------------------------------------------------------
// Parameter blocks
// ---------------------------------------------------------------------------

/// A stage's parameter block, exclusively owned until dispatch.
#[derive(Debug)]
pub struct ParameterBlock {
    buffer: RecycledBuffer,
    descriptors: HeapRange,
}

impl ParameterBlock {
    pub fn stage(&self) -> StageId {
        self.buffer.stage
    }

    pub fn recycle_index(&self) -> RecycleIndex {
        self.buffer.index
    }

    /// Descriptor slots carved for this stage.
    pub fn descriptors(&self) -> HeapRange {
        self.descriptors
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }

    pub fn len(&self) -> usize {
        self.buffer.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

/// Owns the descriptor heap and the recycled buffers.
pub struct ResourceManager {
    heap: Box<dyn DescriptorHeap>,
    buffers: RecycledBufferSet,
    layout: ParameterBlockLayout,
    /// Heap ranges of dispatched frames, released once their tag completes.
    retired: Vec<(CompletionTag, HeapRange)>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("heap_available", &self.heap.available())
            .field("layout", &self.layout)
            .field("recycle_index", &self.buffers.current())
            .field("in_flight", &self.buffers.in_flight())
            .field("retired_reservations", &self.retired.len())
            .finish()
    }
}

impl ResourceManager {
    pub fn new(
        heap: Box<dyn DescriptorHeap>,
        layout: ParameterBlockLayout,
        recycle_slots: usize,
        acquire_timeout: Duration,
    ) -> PipelineResult<Self> {
        Ok(Self {
            heap,
            buffers: RecycledBufferSet::new(recycle_slots, acquire_timeout)?,
            layout,
            retired: Vec::new(),
        })
    }

    pub fn layout(&self) -> ParameterBlockLayout {
        self.layout
    }

    pub fn recycle_index(&self) -> RecycleIndex {
        self.buffers.current()
    }

    /// Move to the next recycle slot (once per frame).
    pub fn advance(&mut self) -> RecycleIndex {
        self.buffers.advance()
    }

    pub fn completion_sender(&self) -> Sender<CompletionTag> {
        self.buffers.completion_sender()
    }

    pub fn heap_available(&self) -> u32 {
        self.heap.available()
    }

    pub fn in_flight(&self) -> usize {
        self.buffers.in_flight()
    }

    /// Reserve descriptor-heap space for every stage of `plan`.
    pub fn request_space(&mut self, plan: &StagePlan) -> PipelineResult<HeapReservation> {
        self.reclaim();
        let slots = plan.descriptor_slots();
        let available = self.heap.available();
        if slots > available {
            return Err(ExhaustedResource::DescriptorHeap {
                requested: slots,
                available,
            }
            .into());
        }
        let range = self.heap.request_space(slots)?;
        debug!(frame = plan.frame.0, slots, offset = range.offset, "Reserved descriptor heap space");
        Ok(HeapReservation { range, used: 0 })
    }

    /// Check out the parameter block of `stage` in recycle slot `index`,
    /// waiting for the device if the slot is still in flight.
    pub fn acquire_block(
        &mut self,
        stage: StageId,
        index: RecycleIndex,
        reservation: &mut HeapReservation,
    ) -> PipelineResult<ParameterBlock> {
        self.acquire_with(stage, index, reservation, true)
    }

    /// Like [`Self::acquire_block`] but fails immediately on a busy slot.
    pub fn try_acquire_block(
        &mut self,
        stage: StageId,
        index: RecycleIndex,
        reservation: &mut HeapReservation,
    ) -> PipelineResult<ParameterBlock> {
        self.acquire_with(stage, index, reservation, false)
    }

    fn acquire_with(
        &mut self,
        stage: StageId,
        index: RecycleIndex,
        reservation: &mut HeapReservation,
        wait: bool,
    ) -> PipelineResult<ParameterBlock> {
        let kind = stage.kind();
        let slots = kind.descriptor_slots();
        if slots > reservation.remaining() {
            return Err(ExhaustedResource::Reservation {
                needed: slots,
                remaining: reservation.remaining(),
            }
            .into());
        }
        let size = self.layout.block_size(kind)?;
        let buffer = if wait {
            self.buffers.acquire(stage, BufferKind::Parameters, index, size)?
        } else {
            self.buffers.try_acquire(stage, BufferKind::Parameters, index, size)?
        };
        let descriptors = reservation.take(slots)?;
        Ok(ParameterBlock { buffer, descriptors })
    }

    /// Check out a constant-data table for `stage`.
    pub fn acquire_table(&mut self, stage: StageId, index: RecycleIndex, size: usize) -> PipelineResult<RecycledBuffer> {
        self.buffers.acquire(stage, BufferKind::ConstantData, index, size)
    }

    /// Hand a dispatched block to the device until `tag` completes.
    pub fn retire_block(&mut self, block: ParameterBlock, tag: CompletionTag) {
        self.buffers.retire(block.buffer, tag);
    }

    pub fn retire_table(&mut self, table: RecycledBuffer, tag: CompletionTag) {
        self.buffers.retire(table, tag);
    }

    /// Return a block that was never dispatched.
    pub fn abandon_block(&mut self, block: ParameterBlock) {
        self.buffers.abandon(block.buffer);
    }

    pub fn abandon_table(&mut self, table: RecycledBuffer) {
        self.buffers.abandon(table);
    }

    /// Keep the frame's heap space until `tag` completes.
    pub fn retire_reservation(&mut self, reservation: HeapReservation, tag: CompletionTag) {
        self.retired.push((tag, reservation.range));
    }

    /// Give an unused reservation straight back to the heap.
    pub fn release_reservation(&mut self, reservation: HeapReservation) {
        self.heap.release(reservation.range);
    }

    /// Device finished everything dispatched under `tag`.
    pub fn mark_complete(&mut self, tag: CompletionTag) {
        self.buffers.mark_complete(tag);
        self.reclaim();
    }

    /// Apply channel completions and release heap space of finished frames.
    pub fn reclaim(&mut self) {
        self.buffers.drain_completions();
        let buffers = &self.buffers;
        let heap = &mut self.heap;
        self.retired.retain(|(tag, range)| {
            if buffers.is_tag_pending(*tag) {
                true
            } else {
                heap.release(*range);
                false
            }
        });
    }
}
