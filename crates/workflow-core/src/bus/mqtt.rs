//! `rumqttc`-backed [`Bus`] transport, grounded on the MQTT dependency
//! choice (`rumqttc` with `use-rustls`) carried over from the pack's
//! `ajime-dev-ajime-agent` reference manifest — the donor codebase has no
//! pub/sub transport of its own to imitate, since it drives subprocesses
//! directly rather than talking to other agents over a bus.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::{Bus, BusError, InboundMessage, UserProperties};

/// User-properties are carried as a JSON object embedded alongside the
/// payload (`{"properties": {...}, "payload": ...}`) rather than as MQTT 5
/// user-properties, so this transport works unmodified against MQTT 3.1.1
/// brokers too.
#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope {
    properties: UserProperties,
    payload: Value,
}

pub struct MqttBus {
    client: AsyncClient,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl MqttBus {
    /// Connect to `broker_url` (`host:port`) and spawn the background task
    /// that pumps the `rumqttc` event loop into an inbound channel.
    pub fn connect(broker_url: &str, client_id: &str, keep_alive_seconds: u64) -> Result<Self, BusError> {
        let (host, port) = split_broker_url(broker_url)?;
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(keep_alive_seconds));

        let (client, mut event_loop) = AsyncClient::new(opts, 256);
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<Envelope>(&publish.payload) {
                            Ok(envelope) => {
                                let msg = InboundMessage {
                                    topic: publish.topic.clone(),
                                    payload: envelope.payload,
                                    properties: envelope.properties,
                                };
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(topic = %publish.topic, %err, "dropping malformed bus envelope");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "mqtt event loop error, retrying");
                    }
                }
            }
            debug!("mqtt event loop task exiting");
        });

        Ok(Self {
            client,
            inbound_rx: AsyncMutex::new(rx),
        })
    }
}

impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Value, properties: UserProperties) -> Result<(), BusError> {
        let envelope = Envelope { properties, payload };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| BusError::Publish(e.to_string()))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic_filter: &str) -> Result<(), BusError> {
        self.client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    async fn recv(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }
}

fn split_broker_url(broker_url: &str) -> Result<(String, u16), BusError> {
    let (host, port) = broker_url
        .rsplit_once(':')
        .ok_or_else(|| BusError::Publish(format!("invalid broker url '{broker_url}', expected host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BusError::Publish(format!("invalid port in broker url '{broker_url}'")))?;
    Ok((host.to_string(), port))
}
