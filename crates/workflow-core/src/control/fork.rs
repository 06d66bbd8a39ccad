//! `fork` node: parallel branches merged into a keyed JSON artifact.
//! `spec.md` §4.5 "Fork".

use std::collections::HashMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::model::ForkBranch;
use crate::state::{Completion, ExecutionState, ForkBranchState, ForkTracker, SubTaskState, Tracker};

use super::DispatchIntent;

/// Start every branch. The fork node itself stays pending; the caller is
/// responsible for actually dispatching the returned intents and then
/// calling [`record_sub_task`] with the sub-task id each dispatch minted.
pub fn start(state: &mut ExecutionState, fork_id: &str, branches: &[ForkBranch]) -> Vec<DispatchIntent> {
    let parallel_group_id = format!("fork_{fork_id}_{}", &Uuid::new_v4().simple().to_string()[..8]);

    let branch_states: Vec<ForkBranchState> = branches
        .iter()
        .map(|b| ForkBranchState {
            branch_id: b.id.clone(),
            output_key: b.output_key.clone(),
            sub_task_id: String::new(),
            state: SubTaskState::Dispatched,
            result: None,
        })
        .collect();

    state.active_branches.insert(
        fork_id.to_string(),
        Tracker::Fork(ForkTracker {
            parallel_group_id: parallel_group_id.clone(),
            branches: branch_states,
        }),
    );

    branches
        .iter()
        .enumerate()
        .map(|(idx, b)| DispatchIntent {
            node_id: b.id.clone(),
            agent_name: b.agent_name.clone(),
            input: Value::Object(b.input.clone().into_iter().collect()),
            parent_node_id: Some(fork_id.to_string()),
            parallel_group_id: Some(parallel_group_id.clone()),
            iteration_index: Some(idx as u32),
        })
        .collect()
}

pub fn record_sub_task(state: &mut ExecutionState, fork_id: &str, branch_id: &str, sub_task_id: &str) {
    if let Some(Tracker::Fork(tracker)) = state.active_branches.get_mut(fork_id) {
        if let Some(b) = tracker.branches.iter_mut().find(|b| b.branch_id == branch_id) {
            b.sub_task_id = sub_task_id.to_string();
        }
    }
}

/// Record a branch's result. Returns `true` if this delivery was new
/// (idempotency: a duplicate delivery for an already-terminal branch is
/// dropped by the caller checking the `Err` case).
pub fn on_branch_result(
    state: &mut ExecutionState,
    fork_id: &str,
    branch_id: &str,
    result: Value,
) -> Result<bool, crate::state::InvalidTransition> {
    let Some(Tracker::Fork(tracker)) = state.active_branches.get_mut(fork_id) else {
        return Ok(false);
    };
    let Some(b) = tracker.branches.iter_mut().find(|b| b.branch_id == branch_id) else {
        return Ok(false);
    };
    b.state.transition(SubTaskState::Completed)?;
    b.result = Some(result);
    Ok(tracker.all_settled())
}

/// All branches settled: merge each branch's result under its `output_key`,
/// complete the fork with a marker (the caller persists the merged
/// artifact and passes its name in separately, since artifact I/O is async).
pub fn merged_output(state: &ExecutionState, fork_id: &str) -> Option<Value> {
    let Some(Tracker::Fork(tracker)) = state.active_branches.get(fork_id) else {
        return None;
    };
    let mut merged = serde_json::Map::new();
    for b in &tracker.branches {
        merged.insert(b.output_key.clone(), b.result.clone().unwrap_or(Value::Null));
    }
    Some(Value::Object(merged))
}

pub fn finalize(state: &mut ExecutionState, fork_id: &str, merged: Value, artifact_name: String, version: u64) {
    state.set_output(fork_id, merged);
    state.mark_complete(fork_id, Completion::Artifact { name: artifact_name, version });
    state.active_branches.remove(fork_id);
}
