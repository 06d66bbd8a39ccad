//! Node dispatcher: turn an `agent` node plus the current execution state
//! into a bus request, saving an input artifact when the payload doesn't
//! fit the degenerate chat-text shape, per `spec.md` §4.4.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{ArtifactKey, ArtifactService};
use crate::bus::{is_text_only_schema, MessagePart, OutboundRequest};
use crate::resolve::{resolve_map, resolve_value, OutputsTable, ResolverError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("node '{0}' has no input and multiple dependencies; input is ambiguous")]
    AmbiguousImplicitInput(String),

    #[error("artifact error: {0}")]
    Artifact(String),
}

/// Resolve the effective input payload for a node per the precedence rule:
/// explicit `input` mapping wins; otherwise zero dependencies falls back to
/// the workflow input, exactly one dependency forwards that dependency's
/// output, and more than one dependency with no explicit `input` is an
/// error (there's no way to pick one).
pub fn resolve_node_input(
    node_id: &str,
    input: Option<&HashMap<String, Value>>,
    dependencies: &[String],
    outputs: &OutputsTable,
) -> Result<Value, DispatchError> {
    if let Some(mapping) = input {
        let resolved = resolve_map(mapping, outputs)?;
        return Ok(Value::Object(resolved.into_iter().collect()));
    }

    match dependencies {
        [] => Ok(resolve_value(&Value::String("{{workflow.input}}".to_string()), outputs)?),
        [only] => Ok(resolve_value(&Value::String(format!("{{{{{only}.output}}}}")), outputs)?),
        _ => Err(DispatchError::AmbiguousImplicitInput(node_id.to_string())),
    }
}

/// Mint a sub-task id in the `wf_<execution_id>_<node_id>_<rand8>` shape.
pub fn mint_sub_task_id(execution_id: &str, node_id: &str) -> String {
    let rand8 = &Uuid::new_v4().simple().to_string()[..8];
    format!("wf_{execution_id}_{node_id}_{rand8}")
}

/// Build the part carrying the resolved input: a chat text part when the
/// effective input schema is the degenerate single-`text` shape or absent,
/// otherwise a JSON artifact saved via `artifacts` and referenced by URI.
pub fn build_input_part(
    artifacts: &dyn ArtifactService,
    key_base: &ArtifactKey,
    input: &Value,
    input_schema: Option<&Value>,
) -> Result<MessagePart, DispatchError> {
    let use_text = match input_schema {
        None => true,
        Some(schema) => is_text_only_schema(schema),
    };

    if use_text {
        let text = match input {
            Value::String(s) => s.clone(),
            Value::Object(map) if map.len() == 1 && map.contains_key("text") => {
                map["text"].as_str().unwrap_or_default().to_string()
            }
            other => other.to_string(),
        };
        return Ok(MessagePart::Text { text });
    }

    let version = artifacts
        .save(key_base, input)
        .map_err(|e| DispatchError::Artifact(e.to_string()))?;
    let uri = artifact_uri(key_base, version);
    Ok(MessagePart::File {
        uri,
        mime_type: "application/json".to_string(),
    })
}

pub fn artifact_uri(key: &ArtifactKey, version: u64) -> String {
    format!(
        "artifact://{}/{}/{}/{}?version={}",
        key.app_name, key.user_id, key.session_id, key.filename, version
    )
}

#[allow(clippy::too_many_arguments)]
pub fn build_request(
    sub_task_id: &str,
    workflow_name: &str,
    node_id: &str,
    input_schema: Option<Value>,
    output_schema: Option<Value>,
    input_part: MessagePart,
    task_id: &str,
    context_id: &str,
) -> OutboundRequest {
    OutboundRequest::build(
        sub_task_id,
        workflow_name,
        node_id,
        input_schema,
        output_schema,
        input_part,
        task_id,
        context_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactService;
    use serde_json::json;
    use tempfile::TempDir;

    fn outputs_with(node: &str, output: Value) -> OutputsTable {
        let mut m = HashMap::new();
        m.insert(node.to_string(), json!({ "output": output }));
        m
    }

    #[test]
    fn explicit_input_mapping_is_resolved() {
        let outputs = outputs_with("a", json!({"name": "x"}));
        let mut mapping = HashMap::new();
        mapping.insert("who".to_string(), json!("{{a.output.name}}"));
        let resolved = resolve_node_input("n", Some(&mapping), &[], &outputs).unwrap();
        assert_eq!(resolved, json!({"who": "x"}));
    }

    #[test]
    fn zero_dependencies_falls_back_to_workflow_input() {
        let outputs = outputs_with("workflow_input", json!({"task": "go"}));
        let resolved = resolve_node_input("n", None, &[], &outputs).unwrap();
        assert_eq!(resolved, json!({"task": "go"}));
    }

    #[test]
    fn single_dependency_forwards_its_output() {
        let outputs = outputs_with("upstream", json!({"result": 42}));
        let resolved = resolve_node_input("n", None, &["upstream".to_string()], &outputs).unwrap();
        assert_eq!(resolved, json!({"result": 42}));
    }

    #[test]
    fn multiple_dependencies_with_no_input_is_ambiguous() {
        let outputs = OutputsTable::new();
        let err = resolve_node_input("n", None, &["a".to_string(), "b".to_string()], &outputs).unwrap_err();
        assert!(matches!(err, DispatchError::AmbiguousImplicitInput(_)));
    }

    #[test]
    fn mint_sub_task_id_has_expected_shape() {
        let id = mint_sub_task_id("exec-1", "node-a");
        assert!(id.starts_with("wf_exec-1_node-a_"));
        assert_eq!(id.len(), "wf_exec-1_node-a_".len() + 8);
    }

    #[test]
    fn text_only_schema_uses_text_part() {
        let artifacts = FsArtifactService::new("/tmp/unused");
        let key = ArtifactKey::new("app", "user", "session", "in.json");
        let schema = json!({"properties": {"text": {}}});
        let part = build_input_part(&artifacts, &key, &json!("hello"), Some(&schema)).unwrap();
        assert!(matches!(part, MessagePart::Text { text } if text == "hello"));
    }

    #[test]
    fn structured_schema_saves_artifact_and_references_uri() {
        let tmp = TempDir::new().unwrap();
        let artifacts = FsArtifactService::new(tmp.path());
        let key = ArtifactKey::new("app", "user", "session", "in.json");
        let schema = json!({"properties": {"a": {}, "b": {}}});
        let part = build_input_part(&artifacts, &key, &json!({"a": 1, "b": 2}), Some(&schema)).unwrap();
        match part {
            MessagePart::File { uri, .. } => assert!(uri.starts_with("artifact://app/user/session/in.json?version=")),
            _ => panic!("expected file part"),
        }
    }

    #[test]
    fn no_schema_defaults_to_text_part() {
        let artifacts = FsArtifactService::new("/tmp/unused");
        let key = ArtifactKey::new("app", "user", "session", "in.json");
        let part = build_input_part(&artifacts, &key, &json!("plain"), None).unwrap();
        assert!(matches!(part, MessagePart::Text { .. }));
    }
}
