//! `switch` node: first matching case wins, unmatched branch roots are
//! skipped, no match with no default fails the node. `spec.md` §4.5.

use serde_json::json;
use thiserror::Error;

use crate::dag::Dag;
use crate::model::SwitchCase;
use crate::resolve::{evaluate_condition, ConditionError};
use crate::state::{Completion, ControlMarkerKind, ExecutionState, SkipReason};

use super::propagate_skip;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("switch node '{0}' matched no case and has no default")]
    NoMatch(String),
}

pub fn evaluate(
    dag: &Dag,
    state: &mut ExecutionState,
    node_id: &str,
    cases: &[SwitchCase],
    default: Option<&str>,
) -> Result<(), SwitchError> {
    let mut selected: Option<(usize, &str)> = None;
    for (idx, case) in cases.iter().enumerate() {
        if evaluate_condition(&case.condition, &state.node_outputs)? {
            selected = Some((idx, case.node.as_str()));
            break;
        }
    }

    let (selected_index, selected_node) = match selected {
        Some((idx, node)) => (Some(idx), node),
        None => match default {
            Some(d) => (None, d),
            None => return Err(SwitchError::NoMatch(node_id.to_string())),
        },
    };

    for (idx, case) in cases.iter().enumerate() {
        if Some(idx) != selected_index {
            propagate_skip(dag, state, &case.node, SkipReason::ByBranch);
        }
    }
    if let Some(d) = default {
        if selected_node != d {
            propagate_skip(dag, state, d, SkipReason::ByBranch);
        }
    }

    state.set_output(
        node_id,
        json!({ "selected_branch": selected_node, "selected_case_index": selected_index }),
    );
    state.mark_complete(node_id, Completion::ControlMarker(ControlMarkerKind::SwitchEvaluated));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkflowDefinition, WorkflowNode};
    use serde_json::json as j;
    use std::collections::HashMap;

    fn agent(id: &str) -> WorkflowNode {
        WorkflowNode::Agent {
            id: id.to_string(),
            depends_on: None,
            agent_name: "noop".into(),
            input: None,
            input_schema_override: None,
            output_schema_override: None,
            when: None,
        }
    }

    fn def(cases: Vec<SwitchCase>, default: Option<&str>) -> WorkflowDefinition {
        WorkflowDefinition {
            description: "t".into(),
            input_schema: None,
            output_schema: None,
            nodes: vec![
                WorkflowNode::Switch {
                    id: "s".into(),
                    depends_on: None,
                    cases: cases.clone(),
                    default: default.map(String::from),
                },
                agent("a"),
                agent("b"),
                agent("dflt"),
            ],
            output_mapping: HashMap::new(),
            skills: None,
        }
    }

    #[test]
    fn first_matching_case_wins_and_others_are_skipped() {
        let cases = vec![
            SwitchCase { condition: "true".into(), node: "a".into() },
            SwitchCase { condition: "true".into(), node: "b".into() },
        ];
        let d = def(cases.clone(), Some("dflt"));
        let dag = Dag::build(&d).unwrap();
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        evaluate(&dag, &mut state, "s", &cases, Some("dflt")).unwrap();

        assert!(!state.completed_nodes.contains_key("a"));
        assert!(matches!(
            state.completed_nodes.get("b"),
            Some(crate::state::Completion::Skipped(_))
        ));
        assert!(matches!(
            state.completed_nodes.get("dflt"),
            Some(crate::state::Completion::Skipped(_))
        ));
        assert_eq!(state.node_outputs["s"]["output"]["selected_branch"], j!("a"));
    }

    #[test]
    fn no_match_falls_back_to_default() {
        let cases = vec![SwitchCase { condition: "false".into(), node: "a".into() }];
        let d = def(cases.clone(), Some("dflt"));
        let dag = Dag::build(&d).unwrap();
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        evaluate(&dag, &mut state, "s", &cases, Some("dflt")).unwrap();
        assert_eq!(state.node_outputs["s"]["output"]["selected_branch"], j!("dflt"));
        assert!(matches!(
            state.completed_nodes.get("a"),
            Some(crate::state::Completion::Skipped(_))
        ));
    }

    #[test]
    fn no_match_and_no_default_is_an_error() {
        let cases = vec![SwitchCase { condition: "false".into(), node: "a".into() }];
        let d = def(cases.clone(), None);
        let dag = Dag::build(&d).unwrap();
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let err = evaluate(&dag, &mut state, "s", &cases, None).unwrap_err();
        assert!(matches!(err, SwitchError::NoMatch(_)));
    }
}
