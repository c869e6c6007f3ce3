//! Bridge between a robot's local sensor streams and an MQTT broker.
//!
//! - [`mqtt`] keeps the broker connection alive and routes inbound messages.
//! - [`forwarder`] relays point clouds and images to broker topics.
//! - [`device`] answers remote commands and publishes the heartbeat.

pub mod config;
pub mod device;
pub mod forwarder;
pub mod mqtt;

#[cfg(test)]
mod testing;
