use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::bus::BusError;
use crate::config::ConfigError;
use crate::dag::DagError;
use crate::dispatch::DispatchError;
use crate::resolve::{ConditionError, ResolverError};

/// Top-level error type for the workflow-core library.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Workflow definition failed validation at load time.
    #[error("dag validation error: {0}")]
    Dag(#[from] DagError),

    /// Template/value resolution failed for a node input or the output mapping.
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Condition expression evaluation failed for a conditional/switch/loop node.
    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Bus publish/subscribe transport error.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Artifact service read/write error.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Protocol error: malformed inbound message or unknown sub-task id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Node dispatch failed (input resolution failure, schema mismatch).
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A control-node handler (switch/loop/map) rejected its own inputs —
    /// covers the handler-specific error types that aren't worth a
    /// dedicated top-level variant each.
    #[error("control node error: {0}")]
    Control(String),

    /// A node reported failure or was synthesized as failed by a timeout.
    #[error("node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WorkflowError>;
