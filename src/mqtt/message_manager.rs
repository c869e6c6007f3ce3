use chrono::NaiveDateTime;
use std::fmt;

/// An inbound broker message, decoded to text on arrival.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(10).collect();
        write!(f, "{} - {}", self.timestamp, preview)
    }
}

impl CommandMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        CommandMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    /// Payloads are expected to be UTF-8; invalid sequences are replaced
    /// rather than rejected so the router can still log what arrived.
    pub fn from_publish(topic: &str, payload: &[u8]) -> Self {
        Self::from_topic(topic, String::from_utf8_lossy(payload).into_owned())
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.payload)
    }
}
