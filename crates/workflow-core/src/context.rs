//! In-memory execution context: everything the engine needs about one
//! in-flight workflow besides its [`crate::state::ExecutionState`].
//!
//! Cancellation is cooperative, implemented as `Arc<AtomicBool>` plus a
//! `tokio::sync::Notify` rather than a `threading.Event` — the `Notify`
//! lets a sleeping loop-node delay wake up early instead of polling the
//! flag on a timer, matching the "Pending timers are cancelled" guarantee
//! from `spec.md` §5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

/// Identifies the original inbound submit message for ack/reply purposes.
/// Opaque to the engine: whatever embeds it is responsible for turning
/// this back into a transport-level acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundHandle(pub String);

#[derive(Debug, Clone)]
pub struct A2aContext {
    pub logical_task_id: String,
    pub session_id: String,
    pub user_id: String,
    pub client_id: Option<String>,
    pub jsonrpc_request_id: Value,
    pub reply_to_topic: Option<String>,
    pub original_inbound_handle: InboundHandle,
}

/// Cooperative cancellation signal shared between the engine loop and
/// anything it suspends on (loop-node delays, workflow-level timeout).
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if cancelled. Returns `true` if
    /// the sleep ran to completion, `false` if cancellation preempted it.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.notify.notified() => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-workflow execution context. `sub_task_to_node`/`node_to_sub_task`
/// are behind a `tokio::sync::Mutex` because dispatch (registering a new
/// sub-task) and the response router (looking one up) can race even
/// within a nominally single-threaded engine loop once timers and bus
/// polling are interleaved via `select!`.
pub struct ExecutionContext {
    pub workflow_task_id: String,
    pub a2a_context: A2aContext,
    sub_task_to_node: Mutex<HashMap<String, String>>,
    node_to_sub_task: Mutex<HashMap<String, String>>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workflow_task_id: impl Into<String>, a2a_context: A2aContext) -> Self {
        Self {
            workflow_task_id: workflow_task_id.into(),
            a2a_context,
            sub_task_to_node: Mutex::new(HashMap::new()),
            node_to_sub_task: Mutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    pub async fn register(&self, sub_task_id: impl Into<String>, node_id: impl Into<String>) {
        let sub_task_id = sub_task_id.into();
        let node_id = node_id.into();
        self.sub_task_to_node
            .lock()
            .await
            .insert(sub_task_id.clone(), node_id.clone());
        self.node_to_sub_task.lock().await.insert(node_id, sub_task_id);
    }

    pub async fn node_for_sub_task(&self, sub_task_id: &str) -> Option<String> {
        self.sub_task_to_node.lock().await.get(sub_task_id).cloned()
    }

    pub async fn sub_task_for_node(&self, node_id: &str) -> Option<String> {
        self.node_to_sub_task.lock().await.get(node_id).cloned()
    }

    /// Drop a sub-task's correlation entry once it has been handled, so a
    /// duplicate delivery on the same topic is recognized as unknown and
    /// dropped rather than reprocessed.
    pub async fn forget(&self, sub_task_id: &str) {
        if let Some(node_id) = self.sub_task_to_node.lock().await.remove(sub_task_id) {
            self.node_to_sub_task.lock().await.remove(&node_id);
        }
    }
}
