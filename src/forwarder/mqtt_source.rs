//! Sensor frames from a broker on the robot
//!
//! The sensor drivers publish their frames as JSON on a local MQTT broker.
//! [`MqttSource`] subscribes there with a second rumqttc client and fans the
//! decoded frames out through a [`LocalBus`], so forwarders see the same
//! [`SensorSubscription`] they get in-process.
//!
//! ```text
//! sensor driver ─► local broker ─► SourcePump ─► LocalBus ─► ForwardWorker
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::ForwardError;
use super::frames::SensorFrame;
use super::source::{LocalBus, SensorSource, SensorSubscription};

/// Subscribe/unsubscribe requests the local client buffers
const SOURCE_REQUEST_CAPACITY: usize = 10;

/// Connection to the broker the sensor drivers publish on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Must differ from the device's client id when both share a broker
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u64,
    pub max_packet_bytes: usize,
    /// Wait before reconnecting after the local broker went away
    pub reconnect_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            client_id: "vibot_sensor_source".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1883,
            keepalive_seconds: 30,
            max_packet_bytes: 16 * 1024 * 1024,
            reconnect_ms: 1000,
        }
    }
}

impl SourceConfig {
    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keepalive_seconds.max(5)))
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_bytes, self.max_packet_bytes);
        options
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Decodes one local broker payload into a frame.
pub fn decode_frame(payload: &[u8]) -> Result<SensorFrame, ForwardError> {
    serde_json::from_slice(payload).map_err(|e| ForwardError::InvalidPayload(e.to_string()))
}

/// [`SensorSource`] backed by the local broker
pub struct MqttSource {
    client: AsyncClient,
    bus: LocalBus,
}

/// Owns the local client's event loop; run it with [`SourcePump::run`].
pub struct SourcePump {
    eventloop: EventLoop,
    client: AsyncClient,
    bus: LocalBus,
    reconnect: Duration,
    addr: String,
}

impl MqttSource {
    pub fn new(config: &SourceConfig) -> (Self, SourcePump) {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), SOURCE_REQUEST_CAPACITY);
        let bus = LocalBus::new();
        let pump = SourcePump {
            eventloop,
            client: client.clone(),
            bus: bus.clone(),
            reconnect: Duration::from_millis(config.reconnect_ms),
            addr: config.broker_addr(),
        };
        (Self { client, bus }, pump)
    }
}

#[async_trait]
impl SensorSource for MqttSource {
    /// Fails with [`ForwardError::Subscription`] when the request cannot be
    /// queued, e.g. while the local broker has been gone for a while.
    async fn subscribe(&self, topic: &str) -> Result<SensorSubscription, ForwardError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| ForwardError::Subscription(format!("{}: {}", topic, e)))?;

        let client = self.client.clone();
        let owned_topic = topic.to_string();
        Ok(self.bus.register_with(topic, move || {
            if let Err(e) = client.try_unsubscribe(&owned_topic) {
                warn!("Failed to unsubscribe local topic {}: {}", owned_topic, e);
            }
        }))
    }
}

impl SourcePump {
    /// Polls the local broker until `cancel` fires. Lost connections are
    /// retried forever, and every connect resubscribes the open topics.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Reading sensor frames from {}", self.addr);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to local broker {}", self.addr);
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match decode_frame(&publish.payload) {
                        Ok(frame) => {
                            let delivered = self.bus.publish(&publish.topic, frame);
                            trace!("Frame on {} delivered to {}", publish.topic, delivered);
                        }
                        Err(e) => warn!("Dropping frame on {}: {}", publish.topic, e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Local broker {} unavailable: {}", self.addr, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect) => {}
                    }
                }
            }
        }
        debug!("Sensor source stopped");
    }

    // Runs on the event loop, so requests are only queued, never awaited.
    fn resubscribe(&self) {
        for topic in self.bus.topics() {
            if let Err(e) = self.client.try_subscribe(&topic, QoS::AtMostOnce) {
                warn!("Failed to resubscribe local topic {}: {}", topic, e);
            }
        }
    }
}
