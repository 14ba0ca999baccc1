//! Kernel binary set and stage descriptor cache.
//!
//! Binaries come from a [`KernelBinaryProvider`] one family at a time. Each
//! family blob carries a header table of start pointers (64-byte units); a
//! sub-kernel spans from its start to the next header's start, or to the
//! end of the blob for the last header.
//!
//! # Thread Safety
//!
//! `KernelSet` is `Send + Sync`. The blob and descriptor caches use
//! `parking_lot::RwLock`: lookups take the read lock, loading takes the
//! write lock once per family / key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use kp_common::config::HwGeneration;
use kp_common::device::{KernelBinaryProvider, KernelBlob};
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::kernel::{KernelFamily, KernelKey};

use crate::layout::ParameterBlockLayout;
use crate::stage::{StageDescriptor, StageKind};

/// Start pointers are stored in units of this many bytes.
pub const KERNEL_START_UNIT_SHIFT: u32 = 6;

/// Byte extent of one sub-kernel inside a family blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelExtent {
    pub offset: u32,
    pub size: u32,
}

/// Locate header `index` inside `blob`.
pub fn sub_kernel_extent(blob: &KernelBlob, index: usize) -> PipelineResult<KernelExtent> {
    let len = u32::try_from(blob.data.len())
        .map_err(|_| PipelineError::invalid("kernel binary larger than 4 GiB"))?;
    let start = blob.start_pointers.get(index).ok_or_else(|| {
        PipelineError::invalid(format!(
            "kernel header {index} missing ({} headers)",
            blob.start_pointers.len()
        ))
    })?;
    let start = u64::from(*start) << KERNEL_START_UNIT_SHIFT;
    let end = match blob.start_pointers.get(index + 1) {
        Some(next) => u64::from(*next) << KERNEL_START_UNIT_SHIFT,
        None => u64::from(len),
    };
    if start > u64::from(len) || end > u64::from(len) || end < start {
        return Err(PipelineError::invalid(format!(
            "kernel header {index} spans {start:#x}..{end:#x} outside a {len:#x}-byte binary"
        )));
    }
    // Both bounds are within `len`, which fits in u32.
    Ok(KernelExtent {
        offset: start as u32,
        size: (end - start) as u32,
    })
}

/// Loaded kernel binaries plus the stage descriptors derived from them.
pub struct KernelSet {
    provider: Arc<dyn KernelBinaryProvider>,
    layout: ParameterBlockLayout,
    blobs: RwLock<HashMap<KernelFamily, KernelBlob>>,
    descriptors: RwLock<HashMap<(StageKind, KernelKey), StageDescriptor>>,
}

impl std::fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSet")
            .field("layout", &self.layout)
            .field("families", &self.blobs.read().len())
            .field("descriptors", &self.descriptors.read().len())
            .finish()
    }
}

impl KernelSet {
    /// Create a set for one hardware generation; the parameter layout is
    /// fixed here.
    pub fn new(provider: Arc<dyn KernelBinaryProvider>, generation: HwGeneration) -> Self {
        Self {
            provider,
            layout: ParameterBlockLayout::for_generation(generation),
            blobs: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> ParameterBlockLayout {
        self.layout
    }

    /// Load (or return the cached) blob of a family.
    pub fn load_family(&self, family: KernelFamily) -> PipelineResult<KernelBlob> {
        if let Some(blob) = self.blobs.read().get(&family) {
            return Ok(blob.clone());
        }

        let blob = self.provider.kernel_binary(family).ok_or_else(|| {
            PipelineError::invalid(format!("no kernel binary available for {family:?}"))
        })?;
        if blob.start_pointers.len() < family.header_count() {
            return Err(PipelineError::invalid(format!(
                "{family:?} binary has {} headers, expected {}",
                blob.start_pointers.len(),
                family.header_count()
            )));
        }

        info!(
            family = ?family,
            bytes = blob.data.len(),
            headers = blob.start_pointers.len(),
            "Loaded kernel binary"
        );
        self.blobs.write().insert(family, blob.clone());
        Ok(blob)
    }

    /// Load every family up front.
    pub fn preload(&self) -> PipelineResult<usize> {
        let families = [KernelFamily::AvcEncode, KernelFamily::Scaling, KernelFamily::Hme];
        for family in families {
            self.load_family(family)?;
        }
        Ok(families.len())
    }

    /// Descriptor for a stage running kernel `key`.
    pub fn descriptor(&self, kind: StageKind, key: KernelKey) -> PipelineResult<StageDescriptor> {
        if let Some(desc) = self.descriptors.read().get(&(kind, key)) {
            return Ok(desc.clone());
        }

        let blob = self.load_family(key.operation.family())?;
        let extent = sub_kernel_extent(&blob, key.header_index()?)?;
        let desc = StageDescriptor {
            kind,
            key,
            block_size: self.layout.block_size(kind)?,
            descriptor_slots: kind.descriptor_slots(),
            kernel_offset: extent.offset,
            kernel_size: extent.size,
        };

        debug!(
            stage = %kind,
            kernel = %key,
            offset = extent.offset,
            size = extent.size,
            "Cached stage descriptor"
        );
        self.descriptors.write().insert((kind, key), desc.clone());
        Ok(desc)
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.read().len()
    }
}
