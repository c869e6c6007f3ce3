//! Error definitions for the broker connection

use thiserror::Error;

/// Failures of the broker connection and its request channel
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The request could not be queued for the event loop
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Every allowed connect attempt failed
    #[error("Gave up connecting to {broker} after {attempts} attempts")]
    RetriesExhausted { broker: String, attempts: u32 },

    /// The connection driver terminated before a connection was established
    #[error("Connection driver stopped before connecting to {0}")]
    Closed(String),
}
