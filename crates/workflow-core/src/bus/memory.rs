//! In-process bus double for engine tests. Mirrors the donor engine's
//! `SimulatedExecutor`: no network, deterministic, inspectable.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use super::{Bus, BusError, InboundMessage, UserProperties};

/// A message captured by [`MemoryBus::publish`], for test assertions.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Value,
    pub properties: UserProperties,
}

/// Test double for [`Bus`]. `publish` records to `sent` instead of going
/// over the wire; inbound delivery is driven by the test via
/// [`MemoryBus::deliver`].
pub struct MemoryBus {
    sent: Mutex<Vec<PublishedMessage>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Inject an inbound message, as if it arrived on `topic`.
    pub fn deliver(&self, topic: impl Into<String>, payload: Value, properties: UserProperties) {
        let _ = self.inbound_tx.send(InboundMessage {
            topic: topic.into(),
            payload,
            properties,
        });
    }

    pub fn sent_messages(&self) -> Vec<PublishedMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Value, properties: UserProperties) -> Result<(), BusError> {
        self.sent.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            properties,
        });
        Ok(())
    }

    async fn subscribe(&self, _topic_filter: &str) -> Result<(), BusError> {
        // Every topic is implicitly "subscribed": delivery is driven
        // directly by test code via `deliver`.
        Ok(())
    }

    async fn recv(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().unwrap().recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_records_message() {
        let bus = MemoryBus::new();
        bus.publish("acme/agent/request/writer", json!({"hello": "world"}), UserProperties::default())
            .await
            .unwrap();
        let sent = bus.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "acme/agent/request/writer");
    }

    #[tokio::test]
    async fn delivered_message_is_received() {
        let bus = MemoryBus::new();
        bus.deliver("acme/agent/response/wf1/sub1", json!({"ok": true}), UserProperties::default());
        let msg = bus.recv().await.unwrap();
        assert_eq!(msg.topic, "acme/agent/response/wf1/sub1");
        assert_eq!(msg.payload, json!({"ok": true}));
    }

    #[tokio::test]
    async fn messages_are_received_in_delivery_order() {
        let bus = MemoryBus::new();
        bus.deliver("t1", json!(1), UserProperties::default());
        bus.deliver("t2", json!(2), UserProperties::default());
        assert_eq!(bus.recv().await.unwrap().payload, json!(1));
        assert_eq!(bus.recv().await.unwrap().payload, json!(2));
    }
}
