//! Bus abstraction: publish/subscribe over the agent-to-agent protocol.
//!
//! Generalizes the donor engine's pluggable-executor pattern
//! (`WorkflowEngine<E: NodeExecutor = SimulatedExecutor>`) to a pluggable
//! transport: the engine is generic over `B: Bus`, defaulting to the
//! `rumqttc`-backed [`mqtt::MqttBus`] in production and exercised against
//! [`memory::MemoryBus`] in tests.

pub mod memory;
pub mod mqtt;
pub mod protocol;

use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;
pub use protocol::{
    find_node_result, is_text_only_schema, DataPart, MessageEnvelope, MessagePart, NodeResultStatus,
    OutboundParams, OutboundRequest, TaskState, TerminalMessage, TerminalStatus, TerminalTask, Topics,
    UserProperties, RESULT_EMBED_REMINDER,
};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// A message delivered to a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
    pub properties: UserProperties,
}

/// Minimal publish/subscribe surface the engine needs. Implementors own
/// whatever connection state the transport requires; `recv` yields the
/// next inbound message from any subscription, in arrival order.
pub trait Bus: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Value,
        properties: UserProperties,
    ) -> impl std::future::Future<Output = Result<(), BusError>> + Send;

    fn subscribe(&self, topic_filter: &str) -> impl std::future::Future<Output = Result<(), BusError>> + Send;

    fn recv(&self) -> impl std::future::Future<Output = Option<InboundMessage>> + Send;
}
