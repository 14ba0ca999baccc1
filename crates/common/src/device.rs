//! Collaborator abstractions: command sink, kernel-binary provider and
//! descriptor heap.
//!
//! The pipeline never talks to hardware directly. It hands fixed-size
//! [`CommandRecord`]s plus their parameter bytes and resource bindings to a
//! [`CommandSink`], asks a [`KernelBinaryProvider`] for opaque kernel blobs,
//! and reserves descriptor-table slots through a [`DescriptorHeap`].

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::kernel::KernelFamily;

/// Opaque handle to a device surface or buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceHandle(pub u64);

/// Opaque tag signaled by the device once a dispatched slot has been consumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionTag(pub u64);

/// Command record flag: last stage of the frame, flush and submit.
pub const RECORD_FLAG_FINAL: u16 = 1 << 0;

/// Fixed-size command record describing one stage dispatch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandRecord {
    pub opcode: u16,
    pub variant: u16,
    /// Byte offset of the kernel inside its family binary.
    pub kernel_offset: u32,
    pub kernel_size: u32,
    /// Offset of the parameter block in the dynamic state region.
    pub parameter_offset: u32,
    pub parameter_size: u32,
    pub binding_count: u16,
    pub flags: u16,
}

impl CommandRecord {
    pub const SIZE: usize = 24;

    pub fn is_final(&self) -> bool {
        self.flags & RECORD_FLAG_FINAL != 0
    }

    /// Little-endian wire form.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.opcode.to_le_bytes());
        out[2..4].copy_from_slice(&self.variant.to_le_bytes());
        out[4..8].copy_from_slice(&self.kernel_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.kernel_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.parameter_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.parameter_size.to_le_bytes());
        out[20..22].copy_from_slice(&self.binding_count.to_le_bytes());
        out[22..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// One descriptor-table entry: binding table slot -> surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub handle: SurfaceHandle,
}

/// Everything the sink needs to dispatch one stage.
#[derive(Debug)]
pub struct DispatchRequest<'a> {
    pub record: CommandRecord,
    pub parameters: &'a [u8],
    /// Constant-data table uploaded with the stage; empty for most stages.
    pub constant_data: &'a [u8],
    pub bindings: &'a [Binding],
}

/// Device command sink.
///
/// `submit` either accepts the dispatch and returns the tag the device will
/// signal on completion, or rejects it.
pub trait CommandSink: Send {
    fn submit(&mut self, request: &DispatchRequest<'_>) -> PipelineResult<CompletionTag>;
}

/// A family binary plus its header descriptor.
#[derive(Clone, Debug)]
pub struct KernelBlob {
    pub data: Arc<[u8]>,
    /// Kernel start pointers, one per header, in units of 64 bytes.
    pub start_pointers: Vec<u32>,
}

/// Supplies kernel binaries by family.
pub trait KernelBinaryProvider: Send + Sync {
    fn kernel_binary(&self, family: KernelFamily) -> Option<KernelBlob>;
}

/// A contiguous range of descriptor-heap slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapRange {
    pub offset: u32,
    pub len: u32,
}

/// Descriptor-table slot allocator ("request space" protocol).
pub trait DescriptorHeap: Send {
    /// Reserve `slots` descriptor entries. Fails with `ResourceExhausted`
    /// when the heap cannot hold them.
    fn request_space(&mut self, slots: u32) -> PipelineResult<HeapRange>;

    /// Return a previously reserved range.
    fn release(&mut self, range: HeapRange);

    fn available(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_record_wire_layout() {
        let record = CommandRecord {
            opcode: 7,
            variant: 2,
            kernel_offset: 0x400,
            kernel_size: 0x80,
            parameter_offset: 0x1000,
            parameter_size: 160,
            binding_count: 12,
            flags: RECORD_FLAG_FINAL,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), CommandRecord::SIZE);
        assert_eq!(&bytes[0..2], &[7, 0]);
        assert_eq!(&bytes[4..8], &[0x00, 0x04, 0, 0]);
        assert_eq!(&bytes[16..20], &[160, 0, 0, 0]);
        assert!(record.is_final());
        assert!(!CommandRecord::default().is_final());
    }
}
