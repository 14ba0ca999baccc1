//! Software collaborators: an in-memory command sink, kernel provider and
//! descriptor heap.
//!
//! These implement the device traits from [`kp_common::device`] without any
//! hardware. The sink records every dispatch (so tests and tooling can
//! inspect the command stream) and can optionally play the device by
//! signaling completion on a crossbeam channel as soon as a dispatch
//! arrives.
//!
//! ```text
//! EncodePipeline --submit--> RecordingSink --log--> Arc<Mutex<Vec<RecordedDispatch>>>
//!                                   \--auto-complete--> Sender<CompletionTag>
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::trace;

use kp_common::device::{
    Binding, CommandRecord, CommandSink, CompletionTag, DescriptorHeap, DispatchRequest, HeapRange,
    KernelBinaryProvider, KernelBlob,
};
use kp_common::error::{ExhaustedResource, PipelineError, PipelineResult};
use kp_common::kernel::KernelFamily;

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// One accepted dispatch, copied out of the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedDispatch {
    pub tag: CompletionTag,
    pub record: CommandRecord,
    pub parameters: Vec<u8>,
    pub constant_data: Vec<u8>,
    pub bindings: Vec<Binding>,
}

/// Shared view of everything a [`RecordingSink`] accepted.
pub type DispatchLog = Arc<Mutex<Vec<RecordedDispatch>>>;

/// Command sink that keeps every dispatch in memory.
#[derive(Debug)]
pub struct RecordingSink {
    log: DispatchLog,
    next_tag: u64,
    auto_complete: Option<Sender<CompletionTag>>,
    reject_opcode: Option<u16>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            next_tag: 1,
            auto_complete: None,
            reject_opcode: None,
        }
    }

    /// Signal completion on `completions` as soon as a dispatch is accepted.
    pub fn with_auto_complete(mut self, completions: Sender<CompletionTag>) -> Self {
        self.auto_complete = Some(completions);
        self
    }

    /// Reject every dispatch carrying `opcode`.
    pub fn rejecting(mut self, opcode: u16) -> Self {
        self.reject_opcode = Some(opcode);
        self
    }

    /// Handle to the dispatch log; stays valid after the sink is moved.
    pub fn log(&self) -> DispatchLog {
        Arc::clone(&self.log)
    }
}

impl CommandSink for RecordingSink {
    fn submit(&mut self, request: &DispatchRequest<'_>) -> PipelineResult<CompletionTag> {
        if self.reject_opcode == Some(request.record.opcode) {
            return Err(PipelineError::SinkRejected {
                stage: format!("opcode {}", request.record.opcode),
                reason: "rejected by recording sink".into(),
            });
        }

        let tag = CompletionTag(self.next_tag);
        self.next_tag += 1;
        self.log.lock().push(RecordedDispatch {
            tag,
            record: request.record,
            parameters: request.parameters.to_vec(),
            constant_data: request.constant_data.to_vec(),
            bindings: request.bindings.to_vec(),
        });
        trace!(
            tag = tag.0,
            opcode = request.record.opcode,
            bytes = request.parameters.len(),
            bindings = request.bindings.len(),
            "Recorded dispatch"
        );

        if let Some(tx) = &self.auto_complete {
            // A dropped receiver only means nobody is listening any more.
            let _ = tx.send(tag);
        }
        Ok(tag)
    }
}

// ---------------------------------------------------------------------------
// InMemoryKernelProvider
// ---------------------------------------------------------------------------

/// Kernel provider serving blobs from memory.
#[derive(Debug, Default)]
pub struct InMemoryKernelProvider {
    blobs: HashMap<KernelFamily, KernelBlob>,
}

impl InMemoryKernelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with a placeholder binary for every family: each header
    /// gets `units_per_kernel` 64-byte units of filler.
    pub fn synthetic(units_per_kernel: u32) -> Self {
        let mut provider = Self::new();
        for family in [KernelFamily::AvcEncode, KernelFamily::Scaling, KernelFamily::Hme] {
            let count = family.header_count() as u32;
            let start_pointers: Vec<u32> = (0..count).map(|i| i * units_per_kernel).collect();
            let len = (count * units_per_kernel) as usize * 64;
            let filler = family as u8;
            provider.insert(
                family,
                KernelBlob {
                    data: vec![filler; len].into(),
                    start_pointers,
                },
            );
        }
        provider
    }

    pub fn insert(&mut self, family: KernelFamily, blob: KernelBlob) {
        self.blobs.insert(family, blob);
    }

    pub fn remove(&mut self, family: KernelFamily) -> Option<KernelBlob> {
        self.blobs.remove(&family)
    }
}

impl KernelBinaryProvider for InMemoryKernelProvider {
    fn kernel_binary(&self, family: KernelFamily) -> Option<KernelBlob> {
        self.blobs.get(&family).cloned()
    }
}

// ---------------------------------------------------------------------------
// LinearDescriptorHeap
// ---------------------------------------------------------------------------

/// First-fit descriptor heap over `capacity` slots.
#[derive(Debug)]
pub struct LinearDescriptorHeap {
    capacity: u32,
    /// Free ranges sorted by offset, never adjacent.
    free: Vec<HeapRange>,
}

impl LinearDescriptorHeap {
    pub fn new(capacity: u32) -> Self {
        let free = if capacity > 0 {
            vec![HeapRange {
                offset: 0,
                len: capacity,
            }]
        } else {
            Vec::new()
        };
        Self { capacity, free }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl DescriptorHeap for LinearDescriptorHeap {
    fn request_space(&mut self, slots: u32) -> PipelineResult<HeapRange> {
        let Some(pos) = self.free.iter().position(|r| r.len >= slots) else {
            return Err(ExhaustedResource::DescriptorHeap {
                requested: slots,
                available: self.available(),
            }
            .into());
        };
        let range = HeapRange {
            offset: self.free[pos].offset,
            len: slots,
        };
        if self.free[pos].len == slots {
            self.free.remove(pos);
        } else {
            self.free[pos].offset += slots;
            self.free[pos].len -= slots;
        }
        Ok(range)
    }

    fn release(&mut self, range: HeapRange) {
        if range.len == 0 {
            return;
        }
        let pos = self.free.partition_point(|r| r.offset < range.offset);
        self.free.insert(pos, range);

        // Coalesce with the following and preceding neighbours.
        if pos + 1 < self.free.len() && self.free[pos].offset + self.free[pos].len == self.free[pos + 1].offset {
            self.free[pos].len += self.free[pos + 1].len;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].offset + self.free[pos - 1].len == self.free[pos].offset {
            self.free[pos - 1].len += self.free[pos].len;
            self.free.remove(pos);
        }
    }

    fn available(&self) -> u32 {
        self.free.iter().map(|r| r.len).sum()
    }
}
