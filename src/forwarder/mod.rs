//! Stream forwarding subsystem
//!
//! Relays local sensor streams (point clouds, images) to the broker:
//!
//! 1. [`source`] - Local sensor topics and subscriptions
//!    ([`mqtt_source`] reads them from a broker on the robot)
//! 2. [`frames`] - Sensor frames and their hex wire encoding
//! 3. [`session`] - Per-stream session state shared by control and worker
//! 4. [`worker`] - Per-session task consuming one subscription
//! 5. [`forwarder`] - Start/stop API used by the command router
//!
//! # Architecture
//!
//! ```text
//! MqttSource ─┐
//! LocalBus ───┴──► ForwardWorker ──► BrokerLink ──► broker
//!                  (throttle, encode,
//!                   count, auto-stop)
//! ```
//!
//! Both stream types share one forwarder implementation; they differ only in
//! the [`StreamKind`] that selects the encoder.

pub mod error;
#[allow(clippy::module_inception)]
pub mod forwarder;
pub mod frames;
pub mod mqtt_source;
pub mod session;
pub mod source;
pub mod worker;

pub use error::ForwardError;
pub use forwarder::{ForwarderStatus, StreamForwarder};
pub use frames::{decode_point_cloud, Image, Point32, PointCloud, SensorFrame, StreamKind};
pub use mqtt_source::{MqttSource, SourceConfig, SourcePump};
pub use session::{CompletionPolicy, ForwardingSession, SessionPhase};
pub use source::{LocalBus, SensorSource, SensorSubscription};
pub use worker::{StreamSettings, WorkerExit};
