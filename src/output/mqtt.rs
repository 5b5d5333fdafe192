//! MQTT transport for the Brewblox eventbus.
//!
//! Owns the rumqttc client and its event loop, and forwards rename requests
//! received on the names topic to the broadcast loop.

use super::{OutboundMessage, PublishError, Publisher, Topics};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An external rename request: normalized address to requested name.
pub type NameRequest = BTreeMap<String, String>;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const NAME_REQUEST_BUFFER_SIZE: usize = 16;

/// Parse a names-topic payload. Malformed payloads are rejected as a whole;
/// per-pair validation happens in the device registry.
pub(crate) fn parse_name_request(payload: &[u8]) -> Option<NameRequest> {
    match serde_json::from_slice(payload) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!("Ignoring malformed name request: {}", e);
            None
        }
    }
}

/// MQTT publisher for the eventbus.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Connect to the broker and subscribe to the service's names topic.
    ///
    /// Returns the publisher and a receiver of rename requests. The
    /// connection is maintained by a spawned task; publish failures while
    /// the broker is away surface as `PublishError`s on individual sends.
    pub fn connect(
        host: &str,
        port: u16,
        service_name: &str,
    ) -> (MqttPublisher, mpsc::Receiver<NameRequest>) {
        let topics = Topics::new(service_name);

        let mut options = MqttOptions::new(format!("tilt-listener-{}", service_name), host, port);
        options.set_keep_alive(KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let (names_tx, names_rx) = mpsc::channel(NAME_REQUEST_BUFFER_SIZE);

        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("Connected to eventbus, subscribing to {}", topics.names);
                        // Subscribe on every (re)connect so renames survive
                        // broker restarts
                        if let Err(e) =
                            loop_client.try_subscribe(topics.names.as_str(), QoS::AtLeastOnce)
                        {
                            warn!("Failed to subscribe to {}: {}", topics.names, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == topics.names
                            && let Some(request) = parse_name_request(&publish.payload)
                            && names_tx.send(request).await.is_err()
                        {
                            return; // Receiver dropped, stop the loop
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        (MqttPublisher { client }, names_rx)
    }
}

impl Publisher for MqttPublisher {
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            self.client
                .publish(
                    message.topic,
                    QoS::AtMostOnce,
                    message.retain,
                    message.payload,
                )
                .await
                .map_err(|e| PublishError::Mqtt(e.to_string()))
        })
    }
}
