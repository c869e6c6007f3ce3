//! # MQTT Integration Module
//!
//! Provides the device's single connection to the cloud broker. Every outbound
//! payload (sensor streams, command responses, heartbeats) and every inbound
//! command travels through this module.
//!
//! ## Why This Module Exists
//!
//! The device runs unattended, so the broker link has to survive network
//! drops and broker restarts on its own:
//! - Connect attempts are retried with a fixed backoff until they succeed or a
//!   configured attempt budget runs out
//! - A link lost without a prior `disconnect()` restarts the connect loop
//! - An intentional `disconnect()` is remembered and never triggers a reconnect
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection parameters, QoS and retry policy
//! ├── error.rs            - Connection error type
//! ├── message_manager.rs  - Inbound message representation
//! └── mqtt_handler.rs     - Connection handle, event loop driver, handler traits
//! ```
//!
//! ## Design Philosophy
//!
//! - **Composition over inheritance**: components receive an
//!   `Arc<dyn BrokerLink>` instead of extending a connection type
//! - **Explicit handlers**: inbound traffic is delivered to a registered
//!   [`InboundHandler`] rather than overridden callbacks
//! - **Tagged results**: connect attempts report a [`ConnectOutcome`] instead
//!   of a bare integer; the integer is still derived for logging and inspection
//! - **Cancellable**: every wait in the driver observes a `CancellationToken`

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{ConnectionConfig, QosLevel, RetryPolicy};
pub use error::ConnectionError;
pub use message_manager::CommandMessage;
pub use mqtt_handler::{
    BrokerConnection, BrokerLink, ConnectOutcome, ConnectionDriver, ConnectionState,
    DisconnectAction, InboundHandler, NoopHandler,
};
