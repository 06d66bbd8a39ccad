use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `workflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkflowConfig {
    pub engine: EngineConfig,
    pub bus: BusConfig,
    pub artifact: ArtifactConfig,
    pub logging: LoggingConfig,
}

/// Engine-wide timeouts and iteration bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub namespace: String,
    pub agent_name: String,
    pub max_workflow_execution_time_seconds: u64,
    pub default_node_timeout_seconds: u64,
    pub node_cancellation_timeout_seconds: u64,
    pub default_max_loop_iterations: u32,
    pub default_max_map_items: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "a2a".to_string(),
            agent_name: "workflow-executor".to_string(),
            max_workflow_execution_time_seconds: 1800,
            default_node_timeout_seconds: 300,
            node_cancellation_timeout_seconds: 30,
            default_max_loop_iterations: 100,
            default_max_map_items: 100,
        }
    }
}

/// MQTT transport configuration for the agent-request/response bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BusConfig {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive_seconds: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: "localhost:1883".to_string(),
            client_id: "workflow-executor".to_string(),
            keep_alive_seconds: 30,
        }
    }
}

/// Filesystem artifact store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ArtifactConfig {
    pub base_dir: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self { base_dir: ".workflow/artifacts".to_string() }
    }
}

/// Logging/tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}
