//! `map` node: bounded-concurrency, order-preserving iteration over a
//! resolved list. `spec.md` §4.5 "Map".
//!
//! Unlike [`super::fork`], a map node's per-iteration input depends on
//! `_map_item`/`_map_index`, which must be resolved against a
//! per-iteration copy of the outputs table — that resolution needs the
//! target node's definition, which this module doesn't have. `next_batch`
//! only reserves indices; the engine resolves input and actually
//! dispatches.

use std::collections::VecDeque;

use serde_json::{json, Value};
use thiserror::Error;

use crate::state::{Completion, ExecutionState, MapTracker, Tracker};

const DEFAULT_MAX_ITEMS: usize = 100;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("map node '{0}' items expression did not resolve to a list")]
    NotAList(String),

    #[error("map node '{0}' has {1} items, exceeding max_items={2}")]
    TooManyItems(String, usize, usize),
}

/// Resolve `items` into the list the map will iterate. `null` means "no
/// items" (an empty, immediately-complete map), any other non-array value
/// is an error.
pub fn resolve_items(map_id: &str, items: Value, max_items: Option<usize>) -> Result<Vec<Value>, MapError> {
    let max_items = max_items.unwrap_or(DEFAULT_MAX_ITEMS);
    match items {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            if items.len() > max_items {
                return Err(MapError::TooManyItems(map_id.to_string(), items.len(), max_items));
            }
            Ok(items)
        }
        _ => Err(MapError::NotAList(map_id.to_string())),
    }
}

pub fn init(
    state: &mut ExecutionState,
    map_id: &str,
    target_node_id: &str,
    items: Vec<Value>,
    concurrency_limit: Option<usize>,
) {
    let n = items.len();
    state.active_branches.insert(
        map_id.to_string(),
        Tracker::Map(MapTracker {
            parallel_group_id: format!("map_{map_id}"),
            target_node_id: target_node_id.to_string(),
            items,
            results: vec![None; n],
            pending_indices: (0..n).collect::<VecDeque<_>>(),
            active_indices: Default::default(),
            completed_count: 0,
            concurrency_limit,
        }),
    );
}

/// Pop as many pending indices as current capacity allows, marking them
/// active (with a placeholder empty sub-task id until [`record_sub_task`]
/// fills it in). Returns `(index, item)` pairs in launch order — always
/// the smallest pending index first.
pub fn next_batch(state: &mut ExecutionState, map_id: &str) -> Vec<(usize, Value)> {
    let Some(Tracker::Map(tracker)) = state.active_branches.get_mut(map_id) else {
        return Vec::new();
    };
    let mut batch = Vec::new();
    while tracker.has_capacity() {
        let Some(idx) = tracker.pending_indices.pop_front() else {
            break;
        };
        tracker.active_indices.insert(idx, String::new());
        batch.push((idx, tracker.items[idx].clone()));
    }
    batch
}

pub fn record_sub_task(state: &mut ExecutionState, map_id: &str, index: usize, sub_task_id: &str) {
    if let Some(Tracker::Map(tracker)) = state.active_branches.get_mut(map_id) {
        tracker.active_indices.insert(index, sub_task_id.to_string());
    }
}

/// Record one iteration's result. Returns `true` if every item now has a
/// result (the map is ready to finalize).
pub fn on_result(state: &mut ExecutionState, map_id: &str, index: usize, result: Value) -> bool {
    let Some(Tracker::Map(tracker)) = state.active_branches.get_mut(map_id) else {
        return false;
    };
    if tracker.active_indices.remove(&index).is_none() {
        // Duplicate delivery for an index already settled; ignore.
        return tracker.is_complete();
    }
    tracker.results[index] = Some(result);
    tracker.completed_count += 1;
    tracker.is_complete()
}

pub fn progress(state: &ExecutionState, map_id: &str) -> Option<(usize, usize)> {
    match state.active_branches.get(map_id) {
        Some(Tracker::Map(tracker)) => Some((tracker.completed_count, tracker.results.len())),
        _ => None,
    }
}

pub fn results_array(state: &ExecutionState, map_id: &str) -> Option<Vec<Value>> {
    match state.active_branches.get(map_id) {
        Some(Tracker::Map(tracker)) => Some(tracker.results.iter().map(|r| r.clone().unwrap_or(Value::Null)).collect()),
        _ => None,
    }
}

pub fn finalize(state: &mut ExecutionState, map_id: &str, artifact_name: String, version: u64) {
    let results = results_array(state, map_id).unwrap_or_default();
    state.set_output(map_id, json!({ "results": results }));
    state.mark_complete(map_id, Completion::Artifact { name: artifact_name, version });
    state.active_branches.remove(map_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;

    #[test]
    fn null_items_resolves_to_empty_list() {
        assert_eq!(resolve_items("m", Value::Null, None).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn non_list_items_is_an_error() {
        assert!(resolve_items("m", j!("not a list"), None).is_err());
    }

    #[test]
    fn exceeding_max_items_is_rejected() {
        let items: Vec<Value> = (0..5).map(Value::from).collect();
        assert!(resolve_items("m", Value::Array(items), Some(3)).is_err());
    }

    #[test]
    fn next_batch_respects_concurrency_limit() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let items: Vec<Value> = (0..5).map(Value::from).collect();
        init(&mut state, "m", "inner", items, Some(2));

        let first = next_batch(&mut state, "m");
        assert_eq!(first.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
        // At capacity: no more until something completes.
        assert!(next_batch(&mut state, "m").is_empty());
    }

    #[test]
    fn results_preserve_input_index_order_regardless_of_completion_order() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let items: Vec<Value> = (0..3).map(Value::from).collect();
        init(&mut state, "m", "inner", items, None);
        next_batch(&mut state, "m");

        on_result(&mut state, "m", 2, j!("c"));
        on_result(&mut state, "m", 0, j!("a"));
        let ready = on_result(&mut state, "m", 1, j!("b"));

        assert!(ready);
        assert_eq!(results_array(&state, "m").unwrap(), vec![j!("a"), j!("b"), j!("c")]);
    }

    #[test]
    fn completing_an_index_frees_capacity_for_the_next_one() {
        let mut state = ExecutionState::new("wf", "exec-1", j!({}));
        let items: Vec<Value> = (0..3).map(Value::from).collect();
        init(&mut state, "m", "inner", items, Some(1));
        let first = next_batch(&mut state, "m");
        assert_eq!(first.len(), 1);

        on_result(&mut state, "m", 0, j!("a"));
        let second = next_batch(&mut state, "m");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, 1);
    }
}
