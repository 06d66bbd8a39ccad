//! Per-workflow execution state: what's completed, what's pending, and the
//! typed trackers for in-flight fork/map/loop/join branches.
//!
//! Replaces the donor original's dynamic, duck-typed `active_branches`
//! dict-of-dicts and string-sentinel `completed_nodes` values with the
//! tagged types called for in SPEC_FULL.md's REDESIGN FLAGS section.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::JoinStrategy;
use crate::resolve::OutputsTable;

pub const WORKFLOW_INPUT_NODE: &str = "workflow_input";

/// Why a node was skipped rather than executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    /// The node's own `when` clause evaluated false.
    ByWhen,
    /// The node is a conditional/switch branch root that was not selected.
    ByBranch,
    /// The node's dependencies were all skipped, so it was skipped too.
    ByPropagation,
}

/// Marker left behind by a control node that completes itself without
/// producing an artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMarkerKind {
    ConditionalEvaluated,
    SwitchEvaluated,
    JoinComplete,
    LoopMaxIterations,
    LoopConditionFalse,
}

/// What `completed_nodes[id]` stores. Replaces the string sentinels
/// (`"SKIPPED"`, `"CANCELLED"`, a bare artifact name) from the donor
/// original with a closed sum type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Completion {
    Artifact { name: String, version: u64 },
    Skipped(SkipReason),
    Cancelled,
    ControlMarker(ControlMarkerKind),
}

impl Completion {
    /// Every completion marker satisfies a downstream `depends_on` check,
    /// regardless of kind — this is the "ready node" rule from §4.3.
    pub fn satisfies_dependency(&self) -> bool {
        true
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Completion::Skipped(_))
    }
}

/// A single sub-task's lifecycle. Transitions are one-way: once a sub-task
/// leaves `Dispatched` it never returns to it, and a terminal state
/// (`Completed`/`Failed`/`Cancelled`) never changes again. Replaces the
/// donor original's ad-hoc `"result" in branch` presence checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubTaskState {
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid sub-task state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: SubTaskState,
    pub to: SubTaskState,
}

impl SubTaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubTaskState::Dispatched)
    }

    /// Attempt the transition, returning an error if `self` is already
    /// terminal (a duplicate delivery trying to re-complete a branch).
    pub fn transition(&mut self, to: SubTaskState) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            return Err(InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

/// One branch of an in-flight [`crate::model::WorkflowNode::Fork`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkBranchState {
    pub branch_id: String,
    pub output_key: String,
    pub sub_task_id: String,
    pub state: SubTaskState,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkTracker {
    pub parallel_group_id: String,
    pub branches: Vec<ForkBranchState>,
}

impl ForkTracker {
    pub fn all_settled(&self) -> bool {
        self.branches.iter().all(|b| b.state.is_terminal())
    }
}

/// Bounded-concurrency map state. `pending_indices` is a FIFO queue so the
/// launch loop always starts the smallest not-yet-dispatched index first,
/// matching §4.5's "pop the smallest pending index" rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapTracker {
    pub parallel_group_id: String,
    pub target_node_id: String,
    pub items: Vec<Value>,
    pub results: Vec<Option<Value>>,
    pub pending_indices: VecDeque<usize>,
    pub active_indices: HashMap<usize, String>,
    pub completed_count: usize,
    pub concurrency_limit: Option<usize>,
}

impl MapTracker {
    pub fn is_complete(&self) -> bool {
        self.completed_count == self.results.len()
    }

    pub fn has_capacity(&self) -> bool {
        match self.concurrency_limit {
            None => true,
            Some(limit) => self.active_indices.len() < limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTracker {
    pub inner_node_id: String,
    pub iteration: u32,
    pub active_sub_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinLedger {
    pub wait_for: Vec<String>,
    pub strategy: JoinStrategy,
    pub n: Option<usize>,
    pub completed: Vec<String>,
    pub results: HashMap<String, Value>,
}

impl JoinLedger {
    pub fn is_ready(&self) -> bool {
        match self.strategy {
            JoinStrategy::All => self.completed.len() >= self.wait_for.len(),
            JoinStrategy::Any => !self.completed.is_empty(),
            JoinStrategy::NOfM => self.completed.len() >= self.n.unwrap_or(self.wait_for.len()),
        }
    }

    pub fn outstanding(&self) -> Vec<String> {
        self.wait_for
            .iter()
            .filter(|id| !self.completed.contains(id))
            .cloned()
            .collect()
    }
}

/// The typed replacement for the donor original's `active_branches` dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Tracker {
    Fork(ForkTracker),
    Map(MapTracker),
    Loop(LoopTracker),
    Join(JoinLedger),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorState {
    pub failed_node_id: String,
    pub failure_reason: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-workflow execution state, persisted by workflow id in the donor
/// original (an ADK session); here it is simply owned by the
/// [`crate::context::ExecutionContext`] for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_name: String,
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    pub completed_nodes: HashMap<String, Completion>,
    pub pending_nodes: Vec<String>,
    pub node_outputs: OutputsTable,
    pub active_branches: HashMap<String, Tracker>,
    pub error_state: Option<ErrorState>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionState {
    pub fn new(workflow_name: impl Into<String>, execution_id: impl Into<String>, input: Value) -> Self {
        let mut node_outputs = OutputsTable::new();
        node_outputs.insert(WORKFLOW_INPUT_NODE.to_string(), serde_json::json!({ "output": input }));

        Self {
            workflow_name: workflow_name.into(),
            execution_id: execution_id.into(),
            start_time: Utc::now(),
            completed_nodes: HashMap::new(),
            pending_nodes: Vec::new(),
            node_outputs,
            active_branches: HashMap::new(),
            error_state: None,
            metadata: HashMap::new(),
        }
    }

    /// A node is ready iff it is not already completed or pending and every
    /// dependency has a completion marker (of any kind — skip/cancel counts
    /// the same as a real artifact for this purpose, per §4.3).
    pub fn is_ready(&self, node_id: &str, dependencies: &[String]) -> bool {
        if self.completed_nodes.contains_key(node_id) {
            return false;
        }
        if self.pending_nodes.iter().any(|p| p == node_id) {
            return false;
        }
        dependencies.iter().all(|dep| {
            self.completed_nodes
                .get(dep)
                .map(Completion::satisfies_dependency)
                .unwrap_or(false)
        })
    }

    pub fn mark_pending(&mut self, node_id: &str) {
        if !self.pending_nodes.iter().any(|p| p == node_id) {
            self.pending_nodes.push(node_id.to_string());
        }
    }

    pub fn mark_complete(&mut self, node_id: &str, completion: Completion) {
        self.pending_nodes.retain(|p| p != node_id);
        self.completed_nodes.insert(node_id.to_string(), completion);
    }

    pub fn set_output(&mut self, node_id: &str, output: Value) {
        self.node_outputs
            .insert(node_id.to_string(), serde_json::json!({ "output": output }));
    }
}
