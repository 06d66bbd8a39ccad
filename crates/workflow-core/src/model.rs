//! Workflow definition types: the DAG vertices and the document that
//! groups them together.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single branch of a [`WorkflowNode::Fork`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForkBranch {
    pub id: String,
    pub agent_name: String,
    pub input: HashMap<String, Value>,
    pub output_key: String,
}

/// One case of a [`WorkflowNode::Switch`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwitchCase {
    pub condition: String,
    pub node: String,
}

/// Join readiness strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    All,
    Any,
    NOfM,
}

/// A vertex in the workflow DAG.
///
/// Tagged by `type` in the wire format, matching the persisted workflow
/// definition document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowNode {
    Agent {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        agent_name: String,
        #[serde(default)]
        input: Option<HashMap<String, Value>>,
        #[serde(default)]
        input_schema_override: Option<Value>,
        #[serde(default)]
        output_schema_override: Option<Value>,
        #[serde(default)]
        when: Option<String>,
    },
    Conditional {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        condition: String,
        true_branch: String,
        #[serde(default)]
        false_branch: Option<String>,
    },
    Switch {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Option<String>,
    },
    Join {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        wait_for: Vec<String>,
        strategy: JoinStrategy,
        #[serde(default)]
        n: Option<usize>,
    },
    Loop {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        node: String,
        condition: String,
        #[serde(default)]
        max_iterations: Option<u32>,
        #[serde(default)]
        delay: Option<String>,
    },
    Fork {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        branches: Vec<ForkBranch>,
    },
    Map {
        id: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
        items: Value,
        node: String,
        #[serde(default)]
        concurrency_limit: Option<usize>,
        #[serde(default)]
        max_items: Option<usize>,
    },
}

impl WorkflowNode {
    pub fn id(&self) -> &str {
        match self {
            WorkflowNode::Agent { id, .. }
            | WorkflowNode::Conditional { id, .. }
            | WorkflowNode::Switch { id, .. }
            | WorkflowNode::Join { id, .. }
            | WorkflowNode::Loop { id, .. }
            | WorkflowNode::Fork { id, .. }
            | WorkflowNode::Map { id, .. } => id,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        let opt = match self {
            WorkflowNode::Agent { depends_on, .. }
            | WorkflowNode::Conditional { depends_on, .. }
            | WorkflowNode::Switch { depends_on, .. }
            | WorkflowNode::Join { depends_on, .. }
            | WorkflowNode::Loop { depends_on, .. }
            | WorkflowNode::Fork { depends_on, .. }
            | WorkflowNode::Map { depends_on, .. } => depends_on,
        };
        opt.as_deref().unwrap_or(&[])
    }

    /// Every node id this node references as a structural target (branch
    /// roots, join targets, inner loop/map nodes). Used by the validator to
    /// check referential integrity independent of `depends_on`.
    pub fn structural_targets(&self) -> Vec<&str> {
        match self {
            WorkflowNode::Agent { .. } => vec![],
            WorkflowNode::Conditional {
                true_branch,
                false_branch,
                ..
            } => {
                let mut v = vec![true_branch.as_str()];
                if let Some(f) = false_branch {
                    v.push(f.as_str());
                }
                v
            }
            WorkflowNode::Switch { cases, default, .. } => {
                let mut v: Vec<&str> = cases.iter().map(|c| c.node.as_str()).collect();
                if let Some(d) = default {
                    v.push(d.as_str());
                }
                v
            }
            WorkflowNode::Join { wait_for, .. } => wait_for.iter().map(String::as_str).collect(),
            WorkflowNode::Loop { node, .. } => vec![node.as_str()],
            WorkflowNode::Fork { branches, .. } => {
                branches.iter().map(|b| b.id.as_str()).collect()
            }
            WorkflowNode::Map { node, .. } => vec![node.as_str()],
        }
    }

    /// The node id that is an "inner" target of this node (loop/map only).
    pub fn inner_target(&self) -> Option<&str> {
        match self {
            WorkflowNode::Loop { node, .. } | WorkflowNode::Map { node, .. } => Some(node.as_str()),
            _ => None,
        }
    }
}

/// Complete workflow definition: a DAG of [`WorkflowNode`]s plus the
/// mapping from final node outputs to the workflow's reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    pub nodes: Vec<WorkflowNode>,
    pub output_mapping: HashMap<String, Value>,
    #[serde(default)]
    pub skills: Option<Vec<Value>>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }
}
