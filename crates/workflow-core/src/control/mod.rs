//! Control-node handlers: conditional, switch, join, loop, fork, map.
//!
//! Handlers run synchronously against [`crate::state::ExecutionState`] and
//! either mark themselves complete outright or register a [`Tracker`] and
//! stay pending. Handlers that need to start child work return
//! [`DispatchIntent`]s; the engine loop is the only thing that actually
//! talks to the bus, so these modules stay free of I/O and are unit
//! testable in isolation.

pub mod conditional;
pub mod fork;
pub mod join;
pub mod loop_node;
pub mod map;
pub mod switch;

use std::collections::VecDeque;

use serde_json::Value;

use crate::dag::Dag;
use crate::state::{Completion, ExecutionState, SkipReason};

/// A child execution the engine must dispatch as a result of a control
/// node running: a fork branch, a map iteration, or a loop iteration.
#[derive(Debug, Clone)]
pub struct DispatchIntent {
    pub node_id: String,
    pub agent_name: String,
    pub input: Value,
    pub parent_node_id: Option<String>,
    pub parallel_group_id: Option<String>,
    pub iteration_index: Option<u32>,
}

/// Mark `root` skipped with `reason`, then walk its dependents: a dependent
/// whose every dependency is now skipped is skipped too (`ByPropagation`);
/// a dependent with at least one non-skipped dependency is left alone
/// (it may still run once its other dependencies complete).
pub fn propagate_skip(dag: &Dag, state: &mut ExecutionState, root: &str, reason: SkipReason) {
    state.mark_complete(root, Completion::Skipped(reason));

    let mut queue: VecDeque<String> = dag
        .reverse_dependencies
        .get(root)
        .cloned()
        .unwrap_or_default()
        .into();

    while let Some(node_id) = queue.pop_front() {
        if state.completed_nodes.contains_key(&node_id) {
            continue;
        }
        let deps = dag.dependencies.get(&node_id).cloned().unwrap_or_default();
        let all_skipped = !deps.is_empty()
            && deps
                .iter()
                .all(|d| matches!(state.completed_nodes.get(d), Some(Completion::Skipped(_))));
        if all_skipped {
            state.mark_complete(&node_id, Completion::Skipped(SkipReason::ByPropagation));
            if let Some(children) = dag.reverse_dependencies.get(&node_id) {
                queue.extend(children.iter().cloned());
            }
        }
    }
}
