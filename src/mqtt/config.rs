use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// MQTT delivery guarantee for a single publish or subscription.
///
/// Serialized as the plain integer used on the wire (`0`, `1` or `2`) so
/// configuration files can keep writing `qos = 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Parameters of the broker connection, fixed for the lifetime of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default topic for publish/unsubscribe calls that name no topic
    pub topic: String,
    pub client_id: String,
    /// Broker user name, empty for anonymous access
    pub user_id: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u64,
    pub qos: QosLevel,
    /// Largest packet accepted in either direction, sized for point clouds
    pub max_packet_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            topic: "/iot_device/command".to_string(),
            client_id: "vibot_device".to_string(),
            user_id: String::new(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            keepalive_seconds: 60,
            qos: QosLevel::AtMostOnce,
            max_packet_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Builds the rumqttc options for this connection.
    ///
    /// rumqttc rejects keepalive intervals below five seconds, so shorter
    /// values are raised to that floor.
    pub fn mqtt_options(&self) -> rumqttc::MqttOptions {
        let mut options = rumqttc::MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keepalive_seconds.max(5)))
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_bytes, self.max_packet_bytes);
        if !self.user_id.is_empty() {
            options.set_credentials(&self.user_id, &self.password);
        }
        options
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How the connection driver paces and bounds its connect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Fixed wait between two failed attempts
    pub backoff_ms: u64,
    /// Consecutive failed attempts before giving up, `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: 1000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// True once `attempts` failed attempts exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_parses_wire_levels() {
        assert_eq!(QosLevel::try_from(0), Ok(QosLevel::AtMostOnce));
        assert_eq!(QosLevel::try_from(2), Ok(QosLevel::ExactlyOnce));
        assert!(QosLevel::try_from(3).is_err());
        assert_eq!(u8::from(QosLevel::AtLeastOnce), 1);
    }

    #[test]
    fn qos_maps_to_rumqttc() {
        assert_eq!(
            rumqttc::QoS::from(QosLevel::ExactlyOnce),
            rumqttc::QoS::ExactlyOnce
        );
    }

    #[test]
    fn connection_config_reads_partial_toml() {
        let config: ConnectionConfig = toml::from_str(
            r#"
            host = "broker.local"
            port = 8883
            qos = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.qos, QosLevel::AtLeastOnce);
        assert_eq!(config.topic, "/iot_device/command");
        assert_eq!(config.broker_addr(), "broker.local:8883");
        assert_eq!(config.max_packet_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn connection_config_rejects_bad_qos() {
        let parsed: Result<ConnectionConfig, _> = toml::from_str("qos = 7");
        assert!(parsed.is_err());
    }

    #[test]
    fn retry_policy_bounds() {
        let unbounded = RetryPolicy::default();
        assert!(!unbounded.is_exhausted(u32::MAX));
        assert_eq!(unbounded.backoff(), Duration::from_secs(1));

        let bounded = RetryPolicy {
            backoff_ms: 10,
            max_attempts: Some(3),
        };
        assert!(!bounded.is_exhausted(2));
        assert!(bounded.is_exhausted(3));
    }
}
