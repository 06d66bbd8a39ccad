//! Structured progress events: a side channel for observers, never
//! authoritative state. `spec.md` §4.9.
//!
//! Grounded on the donor's `artifact::events` JSONL writer — same
//! append-only-file-plus-redaction shape, different event vocabulary.
//! Dropping an event here must never change execution outcomes, so
//! publication failures are logged and swallowed rather than propagated.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::ArtifactError;
use crate::security::SecretRedactor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    NodeExecutionStart,
    NodeExecutionResult,
    MapProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_name: String,
    pub execution_id: String,
    pub kind: ProgressKind,
    pub node_id: Option<String>,
    pub data: Value,
}

impl ProgressEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        workflow_name: impl Into<String>,
        execution_id: impl Into<String>,
        kind: ProgressKind,
        node_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            timestamp,
            workflow_name: workflow_name.into(),
            execution_id: execution_id.into(),
            kind,
            node_id,
            data,
        }
    }
}

/// Derives the bus topic observers subscribe to for one execution's
/// progress events: `N/workflow/progress/<workflow_name>/<execution_id>`.
pub fn observer_topic(namespace: &str, workflow_name: &str, execution_id: &str) -> String {
    format!("{namespace}/workflow/progress/{workflow_name}/{execution_id}")
}

/// Append-only JSONL sink for progress events, mirroring the donor's
/// `EventWriter`. A sink failure is never fatal to the workflow; callers
/// should log and move on rather than unwrap.
pub struct ProgressSink {
    file: Mutex<std::fs::File>,
    redactor: SecretRedactor,
}

impl ProgressSink {
    pub fn create(path: &Path) -> Result<Self, ArtifactError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file), redactor: SecretRedactor::new() })
    }

    pub fn write(&self, event: &ProgressEvent) -> Result<(), ArtifactError> {
        let line = serde_json::to_string(event)?;
        let redacted = self.redactor.redact_line(&line);
        let mut file = self.file.lock().expect("progress sink mutex poisoned");
        writeln!(file, "{redacted}")?;
        file.flush()?;
        Ok(())
    }
}

pub fn default_progress_log_path(base_dir: &Path, workflow_name: &str, execution_id: &str) -> PathBuf {
    base_dir.join(workflow_name).join(execution_id).join("progress.jsonl")
}
