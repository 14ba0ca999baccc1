//! `kp-encoder` -- GPU encode kernel-pipeline orchestration and rate control.
//!
//! Sequences the compute-kernel stages of a hardware video encoder, manages
//! the parameter blocks and descriptor tables each dispatch needs, and runs
//! the closed-loop bitrate controller that sets every frame's size target.
//!
//! # Architecture
//!
//! - [`graph`] -- Stage graph orchestrator (which stages run, in what order)
//! - [`downscale`] -- Cache of pictures that already have downscaled copies
//! - [`resources`] -- Descriptor heap reservations, parameter blocks, resource binding
//! - [`recycle`] -- N-way recycled buffer set for CPU/device overlap
//! - [`layout`] -- Per-generation parameter block layouts and packing
//! - [`kernels`] -- Kernel binaries and the stage descriptor cache
//! - [`brc`] -- Rate control model: Init / Reset / Update / statistics
//! - [`derive`] -- Parameter derivation rules
//! - [`tables`] -- Immutable constant tables
//! - [`pipeline`] -- [`EncodePipeline`], one frame at a time into the command sink
//! - [`software`] -- In-memory sink, kernel provider and descriptor heap
//!
//! # Frame flow
//!
//! ```text
//! FrameContext
//!   --> StageGraph::plan          brc_init_reset? scale* me* scoreboard? brc* wp* mbenc
//!     --> ResourceManager         heap reservation + recycled parameter blocks
//!       --> derive + layout       StageParameters packed per hardware generation
//!         --> CommandSink         CommandRecord + parameters + bindings -> CompletionTag
//!           --> RateControlModel  committed once the whole frame is dispatched
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use kp_common::PipelineConfig;
//! use kp_encoder::software::{InMemoryKernelProvider, LinearDescriptorHeap, RecordingSink};
//! use kp_encoder::EncodePipeline;
//!
//! let config = PipelineConfig::default();
//! let mut pipeline = EncodePipeline::new(
//!     &config,
//!     Box::new(RecordingSink::new()),
//!     Arc::new(InMemoryKernelProvider::synthetic(4)),
//!     Box::new(LinearDescriptorHeap::new(4096)),
//! )?;
//!
//! for (ctx, input) in frames {
//!     let report = pipeline.encode_frame(&ctx, &input)?;
//!     // ... device runs, MbEnc reports statistics ...
//!     pipeline.complete_frame(&stats_for(report.frame))?;
//! }
//! pipeline.teardown();
//! ```

pub mod brc;
pub mod derive;
pub mod downscale;
pub mod frame;
pub mod graph;
pub mod kernels;
pub mod layout;
pub mod pipeline;
pub mod recycle;
pub mod resources;
pub mod software;
pub mod stage;
pub mod tables;

pub use brc::{BrcSettings, BrcUpdateOutput, RateControlModel, RcState};
pub use frame::{BrcFrameInput, FrameContext, FrameStatistics, PictureId, PictureRef};
pub use graph::{BrcPending, StageGraph};
pub use pipeline::{EncodePipeline, FrameReport, PipelineStats};
pub use stage::{StageId, StageKind, StagePlan};
