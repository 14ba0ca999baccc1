//! Central error types for the pipeline (thiserror-based).

use thiserror::Error;

/// Top-level pipeline error.
///
/// `InvalidParameter`, `ResourceExhausted` and `CopyFailure` abort the
/// current frame. `UpstreamUnavailable` is recoverable: the orchestrator
/// substitutes a default input and logs it instead of returning it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] ExhaustedResource),

    #[error("Constant table copy failed for {table}: need {needed} bytes, destination holds {available}")]
    CopyFailure {
        table: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Upstream output unavailable for {stage}: {missing}")]
    UpstreamUnavailable { stage: String, missing: String },

    #[error("Command sink rejected {stage}: {reason}")]
    SinkRejected { stage: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Shorthand for an [`PipelineError::InvalidParameter`] with a message.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Whether the caller can continue the frame with default inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }
}

/// The resource that ran out when a [`PipelineError::ResourceExhausted`] is raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExhaustedResource {
    #[error("descriptor heap: requested {requested} slots, {available} available")]
    DescriptorHeap { requested: u32, available: u32 },

    #[error("heap reservation: stage needs {needed} slots, {remaining} left")]
    Reservation { needed: u32, remaining: u32 },

    #[error("recycle slot {index} for {stage} is still in flight")]
    RecycleSlot { stage: String, index: usize },
}

/// Convenience Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
