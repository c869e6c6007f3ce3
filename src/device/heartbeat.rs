use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mqtt::{BrokerLink, QosLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub payload: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            payload: "heartbeat".to_string(),
        }
    }
}

/// Periodic liveness publish on a fixed topic
pub struct Heartbeat {
    link: Arc<dyn BrokerLink>,
    topic: String,
    payload: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        topic: impl Into<String>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            link,
            topic: topic.into(),
            payload: config.payload.clone(),
            interval: Duration::from_millis(config.interval_ms.max(1)),
        }
    }

    /// Publishes once immediately, then every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Heartbeat on {} every {:?}", self.topic, self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self
                            .link
                            .publish(Some(&self.topic), self.payload.clone(), QosLevel::AtMostOnce)
                            .await
                        {
                            warn!("Heartbeat publish failed: {}", e);
                        }
                    }
                }
            }
            debug!("Heartbeat stopped");
        })
    }
}
