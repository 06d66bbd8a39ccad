//! `loop` node: do-while iteration over a single inner node.
//! `spec.md` §4.5 "Loop".
//!
//! Split into small steps rather than one big function so the engine can
//! interleave the loop-delay sleep (a suspension point) between
//! `decide` and `begin_iteration` without the handler itself awaiting
//! anything — handlers stay synchronous, matching every other control
//! node in this module.

use serde_json::json;
use thiserror::Error;

use crate::resolve::{evaluate_condition, ConditionError};
use crate::state::{Completion, ControlMarkerKind, ExecutionState, LoopTracker, Tracker};

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopDecision {
    /// Run another iteration. `needs_delay` is true when `delay` is set
    /// and this isn't the first (do-while) iteration.
    Continue { needs_delay: bool },
    StoppedMaxIterations,
    StoppedConditionFalse,
}

/// Decide whether the loop should run another iteration. Call once per
/// visit to the loop node, before `begin_iteration`.
pub fn decide(
    state: &mut ExecutionState,
    loop_id: &str,
    inner_node_id: &str,
    condition: &str,
    max_iterations: u32,
    has_delay: bool,
) -> Result<LoopDecision, LoopError> {
    let iteration = match state.active_branches.get(loop_id) {
        Some(Tracker::Loop(t)) => t.iteration,
        _ => {
            state.active_branches.insert(
                loop_id.to_string(),
                Tracker::Loop(LoopTracker {
                    inner_node_id: inner_node_id.to_string(),
                    iteration: 0,
                    active_sub_task_id: None,
                }),
            );
            0
        }
    };

    if iteration >= max_iterations {
        return Ok(LoopDecision::StoppedMaxIterations);
    }

    if iteration > 0 && !evaluate_condition(condition, &state.node_outputs)? {
        return Ok(LoopDecision::StoppedConditionFalse);
    }

    Ok(LoopDecision::Continue {
        needs_delay: has_delay && iteration > 0,
    })
}

/// Mint the child node id for the next iteration and bump the counter.
/// Returns `(child_id, iteration_index)`.
pub fn begin_iteration(state: &mut ExecutionState, loop_id: &str) -> (String, u32) {
    let tracker = match state.active_branches.get_mut(loop_id) {
        Some(Tracker::Loop(t)) => t,
        _ => unreachable!("decide() must be called before begin_iteration()"),
    };
    let n = tracker.iteration;
    tracker.iteration += 1;
    (format!("{loop_id}_iter_{n}"), n)
}

pub fn record_sub_task(state: &mut ExecutionState, loop_id: &str, sub_task_id: &str) {
    if let Some(Tracker::Loop(tracker)) = state.active_branches.get_mut(loop_id) {
        tracker.active_sub_task_id = Some(sub_task_id.to_string());
    }
}

/// An iteration finished successfully: store its output under the inner
/// node's *original* id (so the next condition evaluation and the next
/// iteration's templates see it via `{{inner_id.output...}}`), then clear
/// the in-flight sub-task so the loop handler can be re-entered.
pub fn on_iteration_result(state: &mut ExecutionState, loop_id: &str, inner_node_id: &str, output: serde_json::Value) {
    state.set_output(inner_node_id, output);
    if let Some(Tracker::Loop(tracker)) = state.active_branches.get_mut(loop_id) {
        tracker.active_sub_task_id = None;
    }
}

pub fn stop(state: &mut ExecutionState, loop_id: &str, decision: LoopDecision) {
    let iterations_completed = match state.active_branches.get(loop_id) {
        Some(Tracker::Loop(t)) => t.iteration,
        _ => 0,
    };
    let stopped_reason = match decision {
        LoopDecision::StoppedMaxIterations => "max_iterations",
        LoopDecision::StoppedConditionFalse => "loop_condition_false",
        LoopDecision::Continue { .. } => unreachable!("stop() called with a Continue decision"),
    };
    let marker = match decision {
        LoopDecision::StoppedMaxIterations => ControlMarkerKind::LoopMaxIterations,
        _ => ControlMarkerKind::LoopConditionFalse,
    };
    state.set_output(
        loop_id,
        json!({ "iterations_completed": iterations_completed, "stopped_reason": stopped_reason }),
    );
    state.mark_complete(loop_id, Completion::ControlMarker(marker));
    state.active_branches.remove(loop_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    #[test]
    fn first_iteration_always_runs_regardless_of_condition() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let decision = decide(&mut state, "l", "inner", "false", 5, false).unwrap();
        assert_eq!(decision, LoopDecision::Continue { needs_delay: false });
    }

    #[test]
    fn second_iteration_checks_condition() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        decide(&mut state, "l", "inner", "true", 5, false).unwrap();
        begin_iteration(&mut state, "l");
        on_iteration_result(&mut state, "l", "inner", j!({"done": false}));

        let decision = decide(&mut state, "l", "inner", "false", 5, false).unwrap();
        assert_eq!(decision, LoopDecision::StoppedConditionFalse);
    }

    #[test]
    fn max_iterations_stops_the_loop() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        for _ in 0..2 {
            let decision = decide(&mut state, "l", "inner", "true", 2, false).unwrap();
            assert_eq!(decision, LoopDecision::Continue { needs_delay: false });
            begin_iteration(&mut state, "l");
            on_iteration_result(&mut state, "l", "inner", j!({}));
        }
        let decision = decide(&mut state, "l", "inner", "true", 2, false).unwrap();
        assert_eq!(decision, LoopDecision::StoppedMaxIterations);
    }

    #[test]
    fn iteration_child_ids_are_sequential() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        decide(&mut state, "l", "inner", "true", 5, false).unwrap();
        let (id0, n0) = begin_iteration(&mut state, "l");
        assert_eq!((id0.as_str(), n0), ("l_iter_0", 0));
        on_iteration_result(&mut state, "l", "inner", j!({}));

        decide(&mut state, "l", "inner", "true", 5, false).unwrap();
        let (id1, n1) = begin_iteration(&mut state, "l");
        assert_eq!((id1.as_str(), n1), ("l_iter_1", 1));
    }

    #[test]
    fn delay_only_applies_after_the_first_iteration() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let first = decide(&mut state, "l", "inner", "true", 5, true).unwrap();
        assert_eq!(first, LoopDecision::Continue { needs_delay: false });
        begin_iteration(&mut state, "l");
        on_iteration_result(&mut state, "l", "inner", j!({}));

        let second = decide(&mut state, "l", "inner", "true", 5, true).unwrap();
        assert_eq!(second, LoopDecision::Continue { needs_delay: true });
    }

    #[test]
    fn stop_records_output_and_clears_tracker() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        decide(&mut state, "l", "inner", "true", 1, false).unwrap();
        begin_iteration(&mut state, "l");
        on_iteration_result(&mut state, "l", "inner", j!({}));
        let decision = decide(&mut state, "l", "inner", "true", 1, false).unwrap();
        stop(&mut state, "l", decision);

        assert_eq!(state.node_outputs["l"]["output"]["stopped_reason"], j!("max_iterations"));
        assert!(!state.active_branches.contains_key("l"));
    }
}
