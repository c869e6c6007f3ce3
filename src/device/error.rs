//! Error definitions for the device command side

use thiserror::Error;

use crate::forwarder::ForwardError;
use crate::mqtt::ConnectionError;

#[derive(Debug, Error)]
pub enum CommandError {
    /// Payload is not one of the known command strings
    #[error("Unknown command: {0}")]
    Unknown(String),

    /// No connection to the vio service, or it did not answer in time
    #[error("Vio service unavailable: {0}")]
    VioUnavailable(String),

    /// The vio request failed for another reason
    #[error("Vio service request failed: {0}")]
    Vio(#[from] reqwest::Error),

    #[error("Failed to serialize response: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] ConnectionError),

    #[error("Forwarding error: {0}")]
    Forward(#[from] ForwardError),
}
