//! Wire format: topic conventions and JSON-RPC envelope construction for
//! the agent-to-agent bus protocol described in `spec.md` §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic builders, namespaced by a fixed prefix.
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn request(&self, agent_or_workflow_name: &str) -> String {
        format!("{}/agent/request/{}", self.namespace, agent_or_workflow_name)
    }

    pub fn response(&self, workflow_name: &str, sub_task_id: &str) -> String {
        format!(
            "{}/agent/response/{}/{}",
            self.namespace, workflow_name, sub_task_id
        )
    }

    /// Wildcard subscription covering every sub-task response for this workflow.
    pub fn response_wildcard(&self, workflow_name: &str) -> String {
        format!("{}/agent/response/{}/+", self.namespace, workflow_name)
    }

    pub fn status(&self, workflow_name: &str, sub_task_id: &str) -> String {
        format!(
            "{}/agent/status/{}/{}",
            self.namespace, workflow_name, sub_task_id
        )
    }

    pub fn status_wildcard(&self, workflow_name: &str) -> String {
        format!("{}/agent/status/{}/+", self.namespace, workflow_name)
    }

    pub fn discovery(&self) -> String {
        format!("{}/agent/discovery", self.namespace)
    }

    pub fn client_response(&self, client_id: &str) -> String {
        format!("{}/client/response/{}", self.namespace, client_id)
    }

    /// Pull the trailing `sub_task_id` segment off a response/status topic.
    pub fn sub_task_id_from_topic(topic: &str) -> Option<&str> {
        topic.rsplit('/').next()
    }
}

/// User-properties the executor sets on an outbound request and consumes
/// on an inbound submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProperties {
    #[serde(rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(rename = "statusTopic", skip_serializing_if = "Option::is_none")]
    pub status_topic: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "a2aUserConfig", skip_serializing_if = "Option::is_none")]
    pub user_config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPart {
    WorkflowNodeRequest {
        workflow_name: String,
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_schema: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    WorkflowNodeResult {
        status: NodeResultStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact_version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Data { data: DataPart },
    Text { text: String },
    File { uri: String, mime_type: String },
}

pub const RESULT_EMBED_REMINDER: &str =
    "End your response with a result embed: \u{ab}result:artifact=<name>:v<version> status=success\u{bb} \
     (or status=failure with a brief error_message) so the orchestrator can pick up your output.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub role: String,
    pub parts: Vec<MessagePart>,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "contextId")]
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub id: String,
    pub method: String,
    pub params: OutboundParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundParams {
    pub message: MessageEnvelope,
}

impl OutboundRequest {
    /// Build the JSON-RPC request for dispatching `node_id` of `workflow_name`
    /// with the given resolved `input`. `input_part` is either the chat text
    /// (degenerate single-`text` schema or no schema) or a file part
    /// referencing the saved input artifact.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        sub_task_id: &str,
        workflow_name: &str,
        node_id: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
        input_part: MessagePart,
        task_id: &str,
        context_id: &str,
    ) -> Self {
        let parts = vec![
            MessagePart::Data {
                data: DataPart::WorkflowNodeRequest {
                    workflow_name: workflow_name.to_string(),
                    node_id: node_id.to_string(),
                    input_schema,
                    output_schema,
                },
            },
            input_part,
            MessagePart::Text {
                text: RESULT_EMBED_REMINDER.to_string(),
            },
        ];

        OutboundRequest {
            id: sub_task_id.to_string(),
            method: "send".to_string(),
            params: OutboundParams {
                message: MessageEnvelope {
                    role: "user".to_string(),
                    parts,
                    task_id: task_id.to_string(),
                    context_id: context_id.to_string(),
                    metadata: Value::Null,
                },
            },
        }
    }
}

/// Whether the degenerate single-field `{text: string}` schema applies, in
/// which case the input is sent as a chat text part rather than an artifact.
pub fn is_text_only_schema(schema: &Value) -> bool {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return false;
    };
    props.len() == 1 && props.contains_key("text")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalTask {
    pub id: String,
    #[serde(rename = "contextId")]
    pub context_id: String,
    pub status: TerminalStatus,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalStatus {
    pub state: String,
    pub message: TerminalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalMessage {
    pub role: String,
    pub parts: Vec<MessagePart>,
}

impl TerminalTask {
    pub fn success(logical_task_id: &str, session_id: &str, workflow_name: &str, output: Value) -> Self {
        Self {
            id: logical_task_id.to_string(),
            context_id: session_id.to_string(),
            status: TerminalStatus {
                state: "completed".to_string(),
                message: TerminalMessage {
                    role: "agent".to_string(),
                    parts: vec![MessagePart::Text {
                        text: "workflow completed".to_string(),
                    }],
                },
            },
            metadata: serde_json::json!({ "workflow_name": workflow_name, "output": output }),
        }
    }

    pub fn failure(logical_task_id: &str, session_id: &str, workflow_name: &str, message: &str) -> Self {
        Self {
            id: logical_task_id.to_string(),
            context_id: session_id.to_string(),
            status: TerminalStatus {
                state: "failed".to_string(),
                message: TerminalMessage {
                    role: "agent".to_string(),
                    parts: vec![MessagePart::Text {
                        text: message.to_string(),
                    }],
                },
            },
            metadata: serde_json::json!({ "workflow_name": workflow_name }),
        }
    }
}

/// Extract the `workflow_node_result` data part from an inbound task's
/// message parts. Missing data part is a protocol error, surfaced by the
/// caller as `ProtocolError`.
pub fn find_node_result(parts: &[MessagePart]) -> Option<(NodeResultStatus, Option<String>, Option<u64>, Option<String>)> {
    for part in parts {
        if let MessagePart::Data {
            data:
                DataPart::WorkflowNodeResult {
                    status,
                    artifact_name,
                    artifact_version,
                    error_message,
                },
        } = part
        {
            return Some((*status, artifact_name.clone(), *artifact_version, error_message.clone()));
        }
    }
    None
}
