//! Test doubles shared by the unit tests

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::mqtt::{BrokerLink, ConnectionError, QosLevel};

const DEFAULT_TOPIC: &str = "/iot_device/command";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QosLevel,
}

/// Records every request instead of talking to a broker
#[derive(Default)]
pub struct RecordingLink {
    published: Mutex<Vec<Published>>,
    subscribed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingLink {
    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn count_on(&self, topic: &str) -> usize {
        self.published.lock().iter().filter(|p| p.topic == topic).count()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }
}

#[async_trait]
impl BrokerLink for RecordingLink {
    async fn publish(
        &self,
        topic: Option<&str>,
        payload: String,
        qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed("recording link".to_string()));
        }
        let topic = topic
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TOPIC)
            .to_string();
        self.published.lock().push(Published {
            topic,
            payload,
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, _topic: Option<&str>) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Accepts requests but never completes them, like a client whose request
/// queue is full while the broker is away
#[derive(Default)]
pub struct StalledLink {
    publishes: AtomicUsize,
    subscribes: AtomicUsize,
}

impl StalledLink {
    pub fn pending_publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn pending_subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerLink for StalledLink {
    async fn publish(
        &self,
        _topic: Option<&str>,
        _payload: String,
        _qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn subscribe(&self, _topic: &str) -> Result<(), ConnectionError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn unsubscribe(&self, _topic: Option<&str>) -> Result<(), ConnectionError> {
        std::future::pending().await
    }
}

/// Collects the message of every WARN event; install it with
/// `tracing::subscriber::set_default` for the duration of a test.
#[derive(Clone, Default)]
pub struct WarningLog {
    messages: Arc<Mutex<Vec<String>>>,
}

impl WarningLog {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl<S: Subscriber> Layer<S> for WarningLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut message = MessageField::default();
        event.record(&mut message);
        self.messages.lock().push(message.0);
    }
}

#[derive(Default)]
struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

/// Polls `condition` every millisecond of (possibly paused) tokio time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
