//! Error definitions for the forwarding module

use thiserror::Error;

use crate::mqtt::ConnectionError;

/// Error types of the stream forwarders
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The sensor frame cannot be encoded as it is
    #[error("Malformed sensor frame: {0}")]
    MalformedFrame(String),

    /// A frame of another stream type arrived on the subscribed topic
    #[error("Unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: &'static str,
    },

    /// Hex payload that does not decode to the expected layout
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Subscribing to the local sensor topic failed
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Publishing to the broker failed
    #[error("Broker error: {0}")]
    Broker(#[from] ConnectionError),
}
