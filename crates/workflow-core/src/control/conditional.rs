//! `conditional` node: evaluate, take one branch, recursively skip the
//! other. See `spec.md` §4.5 "Conditional".

use serde_json::json;

use crate::dag::Dag;
use crate::resolve::{evaluate_condition, ConditionError, OutputsTable};
use crate::state::{Completion, ControlMarkerKind, ExecutionState, SkipReason};

use super::propagate_skip;

pub fn evaluate(
    dag: &Dag,
    state: &mut ExecutionState,
    node_id: &str,
    condition: &str,
    true_branch: &str,
    false_branch: Option<&str>,
) -> Result<(), ConditionError> {
    let result = evaluate_condition(condition, &state.node_outputs)?;

    let skipped = if result { false_branch } else { Some(true_branch) };
    if let Some(skip_target) = skipped {
        propagate_skip(dag, state, skip_target, SkipReason::ByBranch);
    }

    state.set_output(node_id, json!({ "condition_result": result, "condition": condition }));
    state.mark_complete(
        node_id,
        Completion::ControlMarker(ControlMarkerKind::ConditionalEvaluated),
    );
    Ok(())
}
