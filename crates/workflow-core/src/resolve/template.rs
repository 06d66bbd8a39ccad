//! Value expression resolution: literals, `{{path}}` templates, and the
//! `coalesce`/`concat` operator objects.
//!
//! This replaces the donor original's regex-plus-`simple_eval` approach
//! (see the REDESIGN FLAGS in SPEC_FULL.md) with a small hand-written
//! parser: a malformed template is rejected once, by `parse_template`,
//! rather than re-parsed by every resolution.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

const RESERVED_MAP_ITEM: &str = "_map_item";
const RESERVED_MAP_INDEX: &str = "_map_index";
const RESERVED_LOOP_ITERATION: &str = "_loop_iteration";
const WORKFLOW_INPUT_KEY: &str = "workflow_input";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("malformed template string: '{0}'")]
    MalformedTemplate(String),

    #[error("field '{field}' not found in path '{path}'")]
    MissingField { path: String, field: String },

    #[error("workflow input has not been initialized")]
    WorkflowInputUninitialized,

    #[error("operator object must have exactly one key, got {0}")]
    InvalidOperator(usize),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

/// A node's output, keyed by node id. Mirrors `node_outputs[id] = {"output":
/// data}` from the execution state: each stored value is the wrapper object,
/// not the bare payload, so that `{{node.output.field}}` traversal works
/// uniformly.
pub type OutputsTable = HashMap<String, Value>;

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        RESERVED_MAP_ITEM | RESERVED_MAP_INDEX | RESERVED_LOOP_ITERATION
    )
}

/// Rewrite the convenience aliases (`{{item}}`, `{{index}}`, `{{iteration}}`,
/// `{{workflow.parameters.X}}`) to their canonical form before path parsing.
fn apply_aliases(path: &str) -> String {
    if path == "item" {
        return RESERVED_MAP_ITEM.to_string();
    }
    if path == "index" {
        return RESERVED_MAP_INDEX.to_string();
    }
    if path == "iteration" {
        return RESERVED_LOOP_ITERATION.to_string();
    }
    if let Some(rest) = path.strip_prefix("item.") {
        return format!("{RESERVED_MAP_ITEM}.{rest}");
    }
    if let Some(rest) = path.strip_prefix("workflow.parameters.") {
        return format!("workflow.input.{rest}");
    }
    path.to_string()
}

/// Resolve a single `{{ ... }}` template body (the text between the braces,
/// already trimmed) against `outputs`.
pub fn resolve_path(raw_path: &str, outputs: &OutputsTable) -> Result<Value, ResolverError> {
    let path = apply_aliases(raw_path.trim());
    let segments: Vec<&str> = path.split('.').collect();
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(ResolverError::MalformedTemplate(raw_path.to_string()));
    }

    if segments[0] == "workflow" && segments.get(1) == Some(&"input") {
        let base = outputs
            .get(WORKFLOW_INPUT_KEY)
            .and_then(|v| v.get("output"))
            .ok_or(ResolverError::WorkflowInputUninitialized)?;
        return Ok(traverse_nullable(base, &segments[2..]));
    }

    let node_id = segments[0];
    let rest = &segments[1..];

    if is_reserved(node_id) {
        let base = outputs
            .get(node_id)
            .and_then(|v| v.get("output"))
            .cloned()
            .unwrap_or(Value::Null);
        return traverse_strict(&base, rest, &path);
    }

    match outputs.get(node_id) {
        None => Ok(Value::Null),
        Some(wrapper) => traverse_strict(wrapper, rest, &path),
    }
}

fn traverse_nullable(start: &Value, segments: &[&str]) -> Value {
    let mut cur = start.clone();
    for seg in segments {
        match cur.get(seg) {
            Some(v) => cur = v.clone(),
            None => return Value::Null,
        }
    }
    cur
}

fn traverse_strict(start: &Value, segments: &[&str], full_path: &str) -> Result<Value, ResolverError> {
    let mut cur = start.clone();
    for seg in segments {
        match cur.get(seg) {
            Some(v) => cur = v.clone(),
            None => {
                return Err(ResolverError::MissingField {
                    path: full_path.to_string(),
                    field: seg.to_string(),
                })
            }
        }
    }
    Ok(cur)
}

/// Check whether `s` is *exactly* one `{{ ... }}` template (no surrounding
/// text) and return the inner path if so.
fn as_whole_template(s: &str) -> Option<&str> {
    let s = s.trim();
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    Some(inner.trim())
}

/// A resolved value expression: literal, template string, or operator
/// object (`coalesce`/`concat`).
pub fn resolve_value(expr: &Value, outputs: &OutputsTable) -> Result<Value, ResolverError> {
    match expr {
        Value::String(s) => {
            if let Some(path) = as_whole_template(s) {
                resolve_path(path, outputs)
            } else {
                Ok(Value::String(s.clone()))
            }
        }
        Value::Object(map) if map.len() == 1 && (map.contains_key("coalesce") || map.contains_key("concat")) => {
            resolve_operator(map, outputs)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, outputs)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_operator(
    map: &serde_json::Map<String, Value>,
    outputs: &OutputsTable,
) -> Result<Value, ResolverError> {
    if map.len() != 1 {
        return Err(ResolverError::InvalidOperator(map.len()));
    }
    let (op, args) = map.iter().next().unwrap();
    let items = args.as_array().ok_or_else(|| ResolverError::MalformedTemplate(op.clone()))?;

    match op.as_str() {
        "coalesce" => {
            for item in items {
                let resolved = resolve_value(item, outputs)?;
                if !resolved.is_null() {
                    return Ok(resolved);
                }
            }
            Ok(Value::Null)
        }
        "concat" => {
            let mut out = String::new();
            for item in items {
                let resolved = resolve_value(item, outputs)?;
                out.push_str(&stringify(&resolved));
            }
            Ok(Value::String(out))
        }
        other => Err(ResolverError::UnknownOperator(other.to_string())),
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve a mapping of keys to value expressions (used for node `input`
/// mappings and `output_mapping`).
pub fn resolve_map(
    exprs: &HashMap<String, Value>,
    outputs: &OutputsTable,
) -> Result<HashMap<String, Value>, ResolverError> {
    exprs
        .iter()
        .map(|(k, v)| resolve_value(v, outputs).map(|r| (k.clone(), r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs_with(node: &str, output: Value) -> OutputsTable {
        let mut m = HashMap::new();
        m.insert(node.to_string(), json!({ "output": output }));
        m
    }

    #[test]
    fn literal_resolves_to_itself() {
        let outputs = OutputsTable::new();
        assert_eq!(resolve_value(&json!(42), &outputs).unwrap(), json!(42));
        assert_eq!(
            resolve_value(&json!("plain string"), &outputs).unwrap(),
            json!("plain string")
        );
    }

    #[test]
    fn template_resolves_node_output_path() {
        let outputs = outputs_with("a", json!({"ok": true}));
        let resolved = resolve_value(&json!("{{a.output.ok}}"), &outputs).unwrap();
        assert_eq!(resolved, json!(true));
    }

    #[test]
    fn workflow_input_missing_segment_yields_null() {
        let outputs = outputs_with("workflow_input", json!({"present": 1}));
        let resolved = resolve_value(&json!("{{workflow.input.absent}}"), &outputs).unwrap();
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn unknown_node_yields_null_not_error() {
        let outputs = OutputsTable::new();
        let resolved = resolve_value(&json!("{{ghost.output.field}}"), &outputs).unwrap();
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn known_node_missing_field_is_an_error() {
        let outputs = outputs_with("a", json!({"ok": true}));
        let err = resolve_value(&json!("{{a.output.missing}}"), &outputs).unwrap_err();
        assert!(matches!(err, ResolverError::MissingField { .. }));
    }

    #[test]
    fn item_alias_unwraps_reserved_output_directly() {
        let mut outputs = OutputsTable::new();
        outputs.insert("_map_item".to_string(), json!({"output": {"name": "x"}}));
        let resolved = resolve_value(&json!("{{item.name}}"), &outputs).unwrap();
        assert_eq!(resolved, json!("x"));
    }

    #[test]
    fn index_alias_resolves_bare_value() {
        let mut outputs = OutputsTable::new();
        outputs.insert("_map_index".to_string(), json!({"output": 3}));
        let resolved = resolve_value(&json!("{{index}}"), &outputs).unwrap();
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn coalesce_returns_first_non_null() {
        let outputs = OutputsTable::new();
        let expr = json!({"coalesce": [null, "{{ghost.output.x}}", "fallback"]});
        assert_eq!(resolve_value(&expr, &outputs).unwrap(), json!("fallback"));
    }

    #[test]
    fn coalesce_all_null_returns_null() {
        let outputs = OutputsTable::new();
        let expr = json!({"coalesce": [null, "{{ghost.output.x}}"]});
        assert_eq!(resolve_value(&expr, &outputs).unwrap(), Value::Null);
    }

    #[test]
    fn concat_joins_stringified_parts() {
        let outputs = outputs_with("a", json!({"name": "world"}));
        let expr = json!({"concat": ["hello, ", "{{a.output.name}}", "!"]});
        assert_eq!(resolve_value(&expr, &outputs).unwrap(), json!("hello, world!"));
    }

    #[test]
    fn nested_object_resolves_each_value() {
        let outputs = outputs_with("a", json!({"v": 7}));
        let expr = json!({"x": "{{a.output.v}}", "y": "literal"});
        let resolved = resolve_value(&expr, &outputs).unwrap();
        assert_eq!(resolved, json!({"x": 7, "y": "literal"}));
    }

    #[test]
    fn workflow_parameters_alias_maps_to_input() {
        let outputs = outputs_with("workflow_input", json!({"name": "alice"}));
        let resolved = resolve_value(&json!("{{workflow.parameters.name}}"), &outputs).unwrap();
        assert_eq!(resolved, json!("alice"));
    }
}
