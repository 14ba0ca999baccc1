//! Recycled buffer set -- N-way rotation of parameter blocks and constant
//! tables for CPU/device overlap.
//!
//! Each (stage, buffer kind, recycle index) slot moves through
//!
//! ```text
//! Free --acquire--> Writing --retire(tag)--> InFlight(tag) --complete(tag)--> Free
//!                      \--abandon-----------------------------------------------^
//! ```
//!
//! A slot is never handed out for writing while it is `Writing` or
//! `InFlight`. Completions arrive either through [`RecycledBufferSet::mark_complete`]
//! or over the crossbeam channel returned by [`RecycledBufferSet::completion_sender`],
//! which a device thread may own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use kp_common::config::{MAX_RECYCLE_SLOTS, MIN_RECYCLE_SLOTS};
use kp_common::device::CompletionTag;
use kp_common::error::{ExhaustedResource, PipelineError, PipelineResult};
use kp_common::types::RecycleIndex;

use crate::stage::StageId;

/// What a recycled buffer holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Parameters,
    ConstantData,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct SlotKey {
    stage: StageId,
    kind: BufferKind,
    index: RecycleIndex,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    InFlight(CompletionTag),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    storage: Vec<u8>,
}

/// A buffer checked out for writing. Hand it back with
/// [`RecycledBufferSet::retire`] or [`RecycledBufferSet::abandon`].
#[derive(Debug)]
pub struct RecycledBuffer {
    pub stage: StageId,
    pub kind: BufferKind,
    pub index: RecycleIndex,
    pub data: Vec<u8>,
}

/// Rotating pool of per-stage buffers.
#[derive(Debug)]
pub struct RecycledBufferSet {
    slot_count: usize,
    current: RecycleIndex,
    slots: HashMap<SlotKey, Slot>,
    completion_tx: Sender<CompletionTag>,
    completion_rx: Receiver<CompletionTag>,
    timeout: Duration,
}

impl RecycledBufferSet {
    pub fn new(slot_count: usize, timeout: Duration) -> PipelineResult<Self> {
        if !(MIN_RECYCLE_SLOTS..=MAX_RECYCLE_SLOTS).contains(&slot_count) {
            return Err(PipelineError::invalid(format!(
                "recycle slot count {slot_count} outside {MIN_RECYCLE_SLOTS}..={MAX_RECYCLE_SLOTS}"
            )));
        }
        let (completion_tx, completion_rx) = channel::unbounded();
        Ok(Self {
            slot_count,
            current: RecycleIndex::default(),
            slots: HashMap::new(),
            completion_tx,
            completion_rx,
            timeout,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Recycle index the current frame writes into.
    pub fn current(&self) -> RecycleIndex {
        self.current
    }

    /// Move to the next slot; called once per frame.
    pub fn advance(&mut self) -> RecycleIndex {
        self.current = self.current.advance(self.slot_count);
        self.current
    }

    /// Sender a device thread can signal completions on.
    pub fn completion_sender(&self) -> Sender<CompletionTag> {
        self.completion_tx.clone()
    }

    /// Whether the slot is checked out or still owned by the device.
    pub fn is_busy(&self, stage: StageId, kind: BufferKind, index: RecycleIndex) -> bool {
        self.slots
            .get(&SlotKey { stage, kind, index })
            .is_some_and(|s| s.state != SlotState::Free)
    }

    /// Check out a slot without waiting.
    ///
    /// Fails with `ResourceExhausted` while the slot is busy.
    pub fn try_acquire(
        &mut self,
        stage: StageId,
        kind: BufferKind,
        index: RecycleIndex,
        size: usize,
    ) -> PipelineResult<RecycledBuffer> {
        self.drain_completions();
        self.checkout(SlotKey { stage, kind, index }, size)
    }

    /// Check out a slot, waiting up to the configured timeout for the
    /// device to release it.
    pub fn acquire(
        &mut self,
        stage: StageId,
        kind: BufferKind,
        index: RecycleIndex,
        size: usize,
    ) -> PipelineResult<RecycledBuffer> {
        self.drain_completions();
        let key = SlotKey { stage, kind, index };
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.slots.get(&key).map(|s| s.state) {
                Some(SlotState::InFlight(tag)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    trace!(stage = %stage, slot = %index, tag = tag.0, "Waiting for in-flight slot");
                    match self.completion_rx.recv_timeout(remaining) {
                        Ok(done) => {
                            self.mark_complete(done);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(stage = %stage, slot = %index, tag = tag.0, "Timed out waiting for device");
                            return Err(busy(stage, index));
                        }
                        // The set owns a sender, so the channel cannot disconnect.
                        Err(RecvTimeoutError::Disconnected) => return Err(busy(stage, index)),
                    }
                }
                // Writing cannot be released by the device.
                _ => return self.checkout(key, size),
            }
        }
    }

    /// Hand a written buffer to the device until `tag` completes.
    pub fn retire(&mut self, buffer: RecycledBuffer, tag: CompletionTag) {
        let key = SlotKey {
            stage: buffer.stage,
            kind: buffer.kind,
            index: buffer.index,
        };
        let slot = self.slots.entry(key).or_insert_with(|| Slot {
            state: SlotState::Free,
            storage: Vec::new(),
        });
        slot.state = SlotState::InFlight(tag);
        slot.storage = buffer.data;
    }

    /// Return a buffer that was never dispatched.
    pub fn abandon(&mut self, buffer: RecycledBuffer) {
        let key = SlotKey {
            stage: buffer.stage,
            kind: buffer.kind,
            index: buffer.index,
        };
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.state = SlotState::Free;
            slot.storage = buffer.data;
        }
    }

    /// Release every slot waiting on `tag`. Returns how many were released.
    pub fn mark_complete(&mut self, tag: CompletionTag) -> usize {
        let mut released = 0;
        for slot in self.slots.values_mut() {
            if slot.state == SlotState::InFlight(tag) {
                slot.state = SlotState::Free;
                released += 1;
            }
        }
        if released > 0 {
            debug!(tag = tag.0, released, "Device completion");
        }
        released
    }

    /// Apply every completion waiting on the channel.
    pub fn drain_completions(&mut self) -> usize {
        let mut released = 0;
        while let Ok(tag) = self.completion_rx.try_recv() {
            released += self.mark_complete(tag);
        }
        released
    }

    /// Whether any slot is still waiting on `tag`.
    pub fn is_tag_pending(&self, tag: CompletionTag) -> bool {
        self.slots
            .values()
            .any(|s| s.state == SlotState::InFlight(tag))
    }

    /// Slots currently owned by the device.
    pub fn in_flight(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s.state, SlotState::InFlight(_)))
            .count()
    }

    fn checkout(&mut self, key: SlotKey, size: usize) -> PipelineResult<RecycledBuffer> {
        let slot = self.slots.entry(key).or_insert_with(|| Slot {
            state: SlotState::Free,
            storage: Vec::new(),
        });
        if slot.state != SlotState::Free {
            return Err(busy(key.stage, key.index));
        }
        slot.state = SlotState::Writing;

        let mut data = std::mem::take(&mut slot.storage);
        data.clear();
        data.resize(size, 0);
        Ok(RecycledBuffer {
            stage: key.stage,
            kind: key.kind,
            index: key.index,
            data,
        })
    }
}

fn busy(stage: StageId, index: RecycleIndex) -> PipelineError {
    ExhaustedResource::RecycleSlot {
        stage: stage.to_string(),
        index: index.0,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const K: RecycleIndex = RecycleIndex(2);

    fn make_set() -> RecycledBufferSet {
        RecycledBufferSet::new(6, Duration::from_millis(50)).unwrap()
    }

    // ── Slot lifecycle ──────────────────────────────────────────────

    #[test]
    fn in_flight_slot_is_not_reacquired_until_complete() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(7));

        let err = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ResourceExhausted(ExhaustedResource::RecycleSlot { index: 2, .. })
        ));

        assert_eq!(set.mark_complete(CompletionTag(7)), 1);
        let again = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        assert_eq!(again.data.len(), 64);
        assert!(again.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn writing_slot_is_busy() {
        let mut set = make_set();
        let _block = set
            .try_acquire(StageId::Scale(kp_common::types::ScaleFactor::X4), BufferKind::Parameters, K, 32)
            .unwrap();
        assert!(set
            .try_acquire(StageId::Scale(kp_common::types::ScaleFactor::X4), BufferKind::Parameters, K, 32)
            .is_err());
    }

    #[test]
    fn abandon_frees_slot() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.abandon(block);
        assert!(!set.is_busy(StageId::MbEnc, BufferKind::Parameters, K));
    }

    #[test]
    fn slots_are_independent() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(1));
        assert!(set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, RecycleIndex(3), 64)
            .is_ok());
        assert!(set
            .try_acquire(StageId::MbEnc, BufferKind::ConstantData, K, 64)
            .is_ok());
        assert!(set
            .try_acquire(StageId::BrcFrameUpdate, BufferKind::Parameters, K, 64)
            .is_ok());
    }

    #[test]
    fn storage_is_reused_and_rezeroed() {
        let mut set = make_set();
        let mut block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        block.data.fill(0xAB);
        set.retire(block, CompletionTag(3));
        set.mark_complete(CompletionTag(3));
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 32)
            .unwrap();
        assert_eq!(block.data, vec![0u8; 32]);
    }

    // ── Completion channel ──────────────────────────────────────────

    #[test]
    fn channel_completion_releases_slot() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(9));
        set.completion_sender().send(CompletionTag(9)).unwrap();
        assert!(set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .is_ok());
    }

    #[test]
    fn tag_pending_until_completed() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(4));
        assert!(set.is_tag_pending(CompletionTag(4)));
        assert!(!set.is_tag_pending(CompletionTag(5)));
        set.mark_complete(CompletionTag(4));
        assert!(!set.is_tag_pending(CompletionTag(4)));
    }

    #[test]
    fn blocking_acquire_waits_for_device_thread() {
        let mut set = RecycledBufferSet::new(2, Duration::from_secs(5)).unwrap();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(11));

        let tx = set.completion_sender();
        let device = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(CompletionTag(11)).unwrap();
        });
        let block = set
            .acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        assert_eq!(block.index, K);
        device.join().unwrap();
    }

    #[test]
    fn blocking_acquire_times_out() {
        let mut set = make_set();
        let block = set
            .try_acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap();
        set.retire(block, CompletionTag(5));
        let err = set
            .acquire(StageId::MbEnc, BufferKind::Parameters, K, 64)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
        assert_eq!(set.in_flight(), 1);
    }

    // ── Rotation ────────────────────────────────────────────────────

    #[test]
    fn index_rotates_round_robin() {
        let mut set = RecycledBufferSet::new(3, Duration::from_millis(1)).unwrap();
        let seen: Vec<usize> = (0..4).map(|_| set.advance().0).collect();
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }

    #[test]
    fn slot_count_bounds() {
        assert!(RecycledBufferSet::new(1, Duration::from_millis(1)).is_err());
        assert!(RecycledBufferSet::new(9, Duration::from_millis(1)).is_err());
        assert!(RecycledBufferSet::new(8, Duration::from_millis(1)).is_ok());
    }
}
