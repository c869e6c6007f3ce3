//! Local sensor topics
//!
//! The robot middleware is reached through the [`SensorSource`] trait. A
//! subscription is a bounded channel of [`SensorFrame`]s plus a registration
//! that is released when the subscription is dropped, so a forwarder cannot
//! leak a subscriber by forgetting to unregister.
//!
//! [`LocalBus`] is the in-process implementation: sensor drivers running in the
//! same process publish frames on it by topic name. It also fans frames out
//! for [`MqttSource`](super::mqtt_source::MqttSource).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::error::ForwardError;
use super::frames::SensorFrame;

/// Frames buffered per subscriber before new frames are dropped
pub const SUBSCRIPTION_CAPACITY: usize = 16;

#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<SensorSubscription, ForwardError>;
}

type Unregister = Box<dyn FnOnce() + Send + Sync>;

/// Live subscription to one local topic. Dropping it unsubscribes.
pub struct SensorSubscription {
    topic: String,
    receiver: mpsc::Receiver<SensorFrame>,
    unregister: Option<Unregister>,
}

impl SensorSubscription {
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::Receiver<SensorFrame>,
        unregister: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next frame, or `None` once the source has gone away.
    pub async fn recv(&mut self) -> Option<SensorFrame> {
        self.receiver.recv().await
    }

    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            info!("Unsubscribing local topic {}", self.topic);
            unregister();
        }
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, mpsc::Sender<SensorFrame>)>>,
}

/// In-process topic bus for sensor frames
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `frame` to every subscriber of `topic` and returns how many
    /// accepted it. Subscribers with a full buffer miss the frame.
    pub fn publish(&self, topic: &str, frame: SensorFrame) -> usize {
        let inner = self.inner.lock();
        let Some(subscribers) = inner.topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, sender) in subscribers {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Subscriber {} on {} missed a frame: {}", id, topic, e),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one subscriber
    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().topics.keys().cloned().collect()
    }

    fn register(&self, topic: &str) -> SensorSubscription {
        self.register_with(topic, || {})
    }

    /// Registers a subscriber; `on_last` runs when the last subscriber of
    /// `topic` unregisters.
    pub(crate) fn register_with(
        &self,
        topic: &str,
        on_last: impl FnOnce() + Send + Sync + 'static,
    ) -> SensorSubscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .topics
                .entry(topic.to_string())
                .or_default()
                .push((id, sender));
            id
        };
        debug!("Registered subscriber {} on {}", id, topic);

        let bus = self.inner.clone();
        let owned_topic = topic.to_string();
        SensorSubscription::new(topic, receiver, move || {
            let last = {
                let mut inner = bus.lock();
                match inner.topics.get_mut(&owned_topic) {
                    Some(subscribers) => {
                        subscribers.retain(|(sub_id, _)| *sub_id != id);
                        let empty = subscribers.is_empty();
                        if empty {
                            inner.topics.remove(&owned_topic);
                        }
                        empty
                    }
                    None => false,
                }
            };
            if last {
                on_last();
            }
        })
    }
}

#[async_trait]
impl SensorSource for LocalBus {
    async fn subscribe(&self, topic: &str) -> Result<SensorSubscription, ForwardError> {
        Ok(self.register(topic))
    }
}
