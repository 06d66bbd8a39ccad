use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{ArtifactConfig, BusConfig, EngineConfig, LoggingConfig, WorkflowConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate a `WorkflowConfig` from a TOML file path.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<WorkflowConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(WorkflowConfig::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_config(&data)
}

/// Parse and validate a `WorkflowConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<WorkflowConfig, ConfigError> {
    let config: WorkflowConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &WorkflowConfig) -> Result<(), ConfigError> {
    if config.engine.namespace.is_empty() {
        return Err(ConfigError::Validation { message: "engine.namespace must not be empty".to_string() });
    }

    if config.engine.max_workflow_execution_time_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "engine.max_workflow_execution_time_seconds must be > 0".to_string(),
        });
    }

    if config.engine.default_node_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "engine.default_node_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.engine.default_max_loop_iterations == 0 {
        return Err(ConfigError::Validation {
            message: "engine.default_max_loop_iterations must be > 0".to_string(),
        });
    }

    if config.engine.default_max_map_items == 0 {
        return Err(ConfigError::Validation {
            message: "engine.default_max_map_items must be > 0".to_string(),
        });
    }

    if config.bus.broker_url.is_empty() {
        return Err(ConfigError::Validation { message: "bus.broker_url must not be empty".to_string() });
    }

    Ok(())
}
