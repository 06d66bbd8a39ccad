pub mod artifact;
pub mod bus;
pub mod config;
pub mod context;
pub mod control;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod progress;
pub mod registry;
pub mod resolve;
pub mod security;
pub mod state;

pub use error::{Result, WorkflowError};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("workflow executor tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_failed_error_display() {
        let err = WorkflowError::NodeFailed { node_id: "build".into(), message: "timed out".into() };
        assert_eq!(err.to_string(), "node 'build' failed: timed out");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: WorkflowError = io_err.into();
        assert!(matches!(err, WorkflowError::Io(_)));
    }
}
