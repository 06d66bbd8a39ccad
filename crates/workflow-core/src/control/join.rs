//! `join` node: wait for `all`/`any`/`n_of_m` of its targets, per
//! `spec.md` §4.5 "Join". The engine re-invokes [`on_target_completed`]
//! every time any node enters `completed_nodes`; it is a no-op unless the
//! given node is actually one of `join_id`'s wait targets.

use serde_json::json;

use crate::model::JoinStrategy;
use crate::state::{Completion, ControlMarkerKind, ExecutionState, JoinLedger, Tracker};

/// Initialize the ledger on first visit to a join node.
pub fn init(state: &mut ExecutionState, join_id: &str, wait_for: Vec<String>, strategy: JoinStrategy, n: Option<usize>) {
    state.active_branches.entry(join_id.to_string()).or_insert_with(|| {
        Tracker::Join(JoinLedger {
            wait_for,
            strategy,
            n,
            completed: Vec::new(),
            results: Default::default(),
        })
    });
}

/// Record that `completed_node` has just entered `completed_nodes`, if it
/// is one of `join_id`'s wait targets. Returns `true` if the join is now
/// ready to finalize.
pub fn on_target_completed(state: &mut ExecutionState, join_id: &str, completed_node: &str) -> bool {
    let result = state.node_outputs.get(completed_node).cloned();
    let Some(Tracker::Join(ledger)) = state.active_branches.get_mut(join_id) else {
        return false;
    };
    if !ledger.wait_for.iter().any(|w| w == completed_node) || ledger.completed.iter().any(|c| c == completed_node) {
        return false;
    }
    ledger.completed.push(completed_node.to_string());
    if let Some(output) = result {
        ledger.results.insert(completed_node.to_string(), output);
    }
    ledger.is_ready()
}

/// Finalize a ready join: mark it complete, and for `any` strategy mark
/// every still-outstanding wait target `Cancelled` so their dependents can
/// proceed as if that branch had resolved.
pub fn finalize(state: &mut ExecutionState, join_id: &str) {
    let Some(Tracker::Join(ledger)) = state.active_branches.get(join_id).cloned() else {
        return;
    };
    let outstanding = ledger.outstanding();
    if ledger.strategy == JoinStrategy::Any {
        for node_id in &outstanding {
            state.mark_complete(node_id, Completion::Cancelled);
        }
    }

    let output = json!({
        "completed_nodes": ledger.completed,
        "results": ledger.results,
        "strategy": match ledger.strategy {
            JoinStrategy::All => "all",
            JoinStrategy::Any => "any",
            JoinStrategy::NOfM => "n_of_m",
        },
    });
    state.set_output(join_id, output);
    state.mark_complete(join_id, Completion::ControlMarker(ControlMarkerKind::JoinComplete));
    state.active_branches.remove(join_id);
}
