//! Pipeline configuration loading from JSON.

use std::path::Path;

use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};

/// Deserialize and validate a pipeline configuration from a JSON string.
///
/// Missing fields take their defaults.
pub fn pipeline_config_from_json(json: &str) -> PipelineResult<PipelineConfig> {
    let config: PipelineConfig = serde_json::from_str(json)?;

    debug!(
        generation = ?config.caps.generation,
        rc_mode = ?config.sequence.rc_mode,
        recycle_slots = config.caps.recycle_slots,
        "Deserialized pipeline config"
    );

    config.validate()?;
    Ok(config)
}

/// Load a pipeline configuration from a file.
pub fn load_pipeline_config(path: &Path) -> PipelineResult<PipelineConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Failed to read pipeline config");
        PipelineError::Io(e)
    })?;

    let config = pipeline_config_from_json(&json)?;

    info!(
        path = %path.display(),
        rc_mode = ?config.sequence.rc_mode,
        target_bitrate = config.sequence.target_bitrate,
        "Pipeline config loaded"
    );

    Ok(config)
}
