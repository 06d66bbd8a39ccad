//! DAG construction and validation over a [`WorkflowDefinition`].
//!
//! Mirrors the topological-level approach in the donor engine's
//! `resolve_order` (Kahn's algorithm over a forward-dependency map) but adds
//! the inner-node classification and reachability checks that a Prescriptive
//! Workflow's loop/map/conditional/switch nodes require.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::model::WorkflowDefinition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("node '{0}' depends on non-existent node '{1}'")]
    DanglingDependency(String, String),

    #[error("node '{0}' references non-existent node '{1}'")]
    DanglingReference(String, String),

    #[error("duplicate node id '{0}'")]
    DuplicateId(String),

    #[error("cycle detected in workflow graph involving node '{0}'")]
    Cycle(String),

    #[error("node '{0}' is unreachable from any root node")]
    Unreachable(String),
}

/// Forward/reverse dependency maps plus inner-node classification for a
/// validated [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct Dag {
    /// node id -> ids it depends on (`depends_on` only; structural targets
    /// like branch roots are not dependencies, they are dispatched by their
    /// parent control node).
    pub dependencies: HashMap<String, Vec<String>>,
    /// node id -> ids that depend on it (the reverse of `dependencies`).
    pub reverse_dependencies: HashMap<String, Vec<String>>,
    /// node ids that are the target of some `loop.node`/`map.node` and thus
    /// never run as a top-level ready node.
    pub inner_nodes: HashSet<String>,
}

impl Dag {
    /// Build and validate the DAG for `def`. Returns every error class
    /// named in `spec.md` §4.2: dangling dependency/reference, duplicate id,
    /// cycle, unreachable non-inner node.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, DagError> {
        let mut node_ids: HashSet<String> = HashSet::new();
        for node in &def.nodes {
            if !node_ids.insert(node.id().to_string()) {
                return Err(DagError::DuplicateId(node.id().to_string()));
            }
        }

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse_dependencies: HashMap<String, Vec<String>> = HashMap::new();
        for id in &node_ids {
            dependencies.entry(id.clone()).or_default();
            reverse_dependencies.entry(id.clone()).or_default();
        }

        let mut inner_nodes = HashSet::new();
        for node in &def.nodes {
            for dep in node.depends_on() {
                if !node_ids.contains(dep) {
                    return Err(DagError::DanglingDependency(
                        node.id().to_string(),
                        dep.clone(),
                    ));
                }
                dependencies.get_mut(node.id()).unwrap().push(dep.clone());
                reverse_dependencies
                    .get_mut(dep)
                    .unwrap()
                    .push(node.id().to_string());
            }

            for target in node.structural_targets() {
                if !node_ids.contains(target) {
                    return Err(DagError::DanglingReference(
                        node.id().to_string(),
                        target.to_string(),
                    ));
                }
            }

            if let Some(inner) = node.inner_target() {
                if !node_ids.contains(inner) {
                    return Err(DagError::DanglingReference(
                        node.id().to_string(),
                        inner.to_string(),
                    ));
                }
                inner_nodes.insert(inner.to_string());
            }
        }

        let dag = Dag {
            dependencies,
            reverse_dependencies,
            inner_nodes,
        };

        dag.check_cycles(&node_ids)?;
        dag.check_reachable(&node_ids)?;

        Ok(dag)
    }

    pub fn is_inner(&self, node_id: &str) -> bool {
        self.inner_nodes.contains(node_id)
    }

    /// Root nodes: not inner, with no dependencies.
    pub fn initial_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(id, deps)| deps.is_empty() && !self.is_inner(id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn check_cycles(&self, node_ids: &HashSet<String>) -> Result<(), DagError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = node_ids.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();

        // DFS over the *dependents* graph (reverse_dependencies), matching
        // the donor original's `_has_cycles` which walks forward from roots
        // through dependents rather than backward through dependencies.
        for start in node_ids {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }
            let mut stack = vec![(start.as_str(), false)];
            while let Some((node, processed)) = stack.pop() {
                if processed {
                    marks.insert(node, Mark::Done);
                    continue;
                }
                match marks.get(node) {
                    Some(Mark::Done) => continue,
                    Some(Mark::InProgress) => {
                        return Err(DagError::Cycle(node.to_string()));
                    }
                    _ => {}
                }
                marks.insert(node, Mark::InProgress);
                stack.push((node, true));
                if let Some(children) = self.reverse_dependencies.get(node) {
                    for child in children {
                        if marks.get(child.as_str()) == Some(&Mark::InProgress) {
                            return Err(DagError::Cycle(child.clone()));
                        }
                        stack.push((child.as_str(), false));
                    }
                }
            }
        }

        Ok(())
    }

    fn check_reachable(&self, node_ids: &HashSet<String>) -> Result<(), DagError> {
        let roots: Vec<&String> = node_ids
            .iter()
            .filter(|id| {
                self.dependencies.get(id.as_str()).map(Vec::len).unwrap_or(0) == 0
                    && !self.is_inner(id)
            })
            .collect();

        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = roots.iter().map(|s| s.as_str()).collect();
        for r in &roots {
            reachable.insert(r.as_str());
        }

        while let Some(node) = queue.pop_front() {
            if let Some(children) = self.reverse_dependencies.get(node) {
                for child in children {
                    if reachable.insert(child.as_str()) {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        for id in node_ids {
            if !self.is_inner(id) && !reachable.contains(id.as_str()) {
                return Err(DagError::Unreachable(id.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JoinStrategy, WorkflowNode};
    use std::collections::HashMap as Map;

    fn agent(id: &str, depends_on: Option<Vec<&str>>) -> WorkflowNode {
        WorkflowNode::Agent {
            id: id.to_string(),
            depends_on: depends_on.map(|v| v.into_iter().map(String::from).collect()),
            agent_name: "noop".into(),
            input: Some(Map::new()),
            input_schema_override: None,
            output_schema_override: None,
            when: None,
        }
    }

    fn def(nodes: Vec<WorkflowNode>) -> WorkflowDefinition {
        WorkflowDefinition {
            description: "test".into(),
            input_schema: None,
            output_schema: None,
            nodes,
            output_mapping: Map::new(),
            skills: None,
        }
    }

    #[test]
    fn linear_chain_builds_and_orders_roots() {
        let d = def(vec![
            agent("a", None),
            agent("b", Some(vec!["a"])),
            agent("c", Some(vec!["b"])),
        ]);
        let dag = Dag::build(&d).unwrap();
        assert_eq!(dag.initial_nodes(), vec!["a"]);
    }

    #[test]
    fn dangling_dependency_rejected() {
        let d = def(vec![agent("a", Some(vec!["ghost"]))]);
        assert_eq!(
            Dag::build(&d).unwrap_err(),
            DagError::DanglingDependency("a".into(), "ghost".into())
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        let d = def(vec![agent("a", None), agent("a", None)]);
        assert_eq!(Dag::build(&d).unwrap_err(), DagError::DuplicateId("a".into()));
    }

    #[test]
    fn cycle_detected() {
        let d = def(vec![
            agent("a", Some(vec!["b"])),
            agent("b", Some(vec!["a"])),
        ]);
        assert!(matches!(Dag::build(&d), Err(DagError::Cycle(_))));
    }

    #[test]
    fn loop_inner_node_excluded_from_initial_and_reachability() {
        let d = def(vec![
            WorkflowNode::Loop {
                id: "l".into(),
                depends_on: None,
                node: "inner".into(),
                condition: "false".into(),
                max_iterations: Some(3),
                delay: None,
            },
            agent("inner", None),
        ]);
        let dag = Dag::build(&d).unwrap();
        assert!(dag.is_inner("inner"));
        assert_eq!(dag.initial_nodes(), vec!["l"]);
    }

    #[test]
    fn join_dangling_wait_for_rejected() {
        let d = def(vec![WorkflowNode::Join {
            id: "j".into(),
            depends_on: None,
            wait_for: vec!["ghost".into()],
            strategy: JoinStrategy::All,
            n: None,
        }]);
        assert!(matches!(Dag::build(&d), Err(DagError::DanglingReference(_, _))));
    }

    #[test]
    fn node_depending_solely_on_an_inner_node_is_unreachable() {
        let d = def(vec![
            WorkflowNode::Loop {
                id: "l".into(),
                depends_on: None,
                node: "inner".into(),
                condition: "false".into(),
                max_iterations: Some(3),
                delay: None,
            },
            agent("inner", None),
            agent("orphan", Some(vec!["inner"])),
        ]);
        assert_eq!(
            Dag::build(&d).unwrap_err(),
            DagError::Unreachable("orphan".into())
        );
    }
}
