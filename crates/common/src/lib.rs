//! `kp-common` -- Shared types, traits, and errors for the KernelPipe encoder.
//!
//! This crate is the foundation the pipeline crates depend on. It defines:
//!
//! - **Types**: `FrameNumber`, `Rational`, `Resolution`, `PictureCodingType`, `RecycleIndex`
//! - **Device traits**: `CommandSink`, `KernelBinaryProvider`, `DescriptorHeap` (collaborator seams)
//! - **Kernels**: `KernelFamily`, `KernelOperation`, `KernelKey` (binary header lookup keys)
//! - **Errors**: `PipelineError`, `ExhaustedResource` (thiserror-based)
//! - **Config**: `SequenceParams`, `FeatureFlags`, `EncoderCaps`, `PipelineConfig` + JSON loading

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod load;
pub mod types;

// Re-export commonly used items at crate root
pub use config::{
    EncoderCaps, FeatureFlags, FrameSizeTolerance, HwGeneration, KernelMode, PipelineConfig,
    RateControlMode, SequenceParams, MAX_QP,
};
pub use device::{
    Binding, CommandRecord, CommandSink, CompletionTag, DescriptorHeap, DispatchRequest,
    HeapRange, KernelBinaryProvider, KernelBlob, SurfaceHandle, RECORD_FLAG_FINAL,
};
pub use error::{ExhaustedResource, PipelineError, PipelineResult};
pub use kernel::{BrcKernel, KernelFamily, KernelKey, KernelOperation};
pub use load::{load_pipeline_config, pipeline_config_from_json};
pub use types::{
    FrameNumber, PictureCodingType, PictureStructure, Rational, RecycleIndex, RefList,
    Resolution, ScaleFactor,
};
