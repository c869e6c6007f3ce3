//! Forwarding worker with statum state machine
//!
//! A worker is spawned per `start_forwarding` call and owns the local
//! subscription for its lifetime.
//!
//! # State Machine
//!
//! ```text
//! Subscribed ──activate──► Running ──(stop | limit | source closed)──► Finished ──release──► WorkerExit
//! ```
//!
//! Per frame the running worker throttles, encodes, publishes and counts.
//! A failing frame is logged and skipped. The limit check runs after every
//! frame whether or not it failed, and `release` always unsubscribes.

use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ForwardError;
use super::frames::{SensorFrame, StreamKind};
use super::session::{CompletionPolicy, ForwardingSession};
use super::source::SensorSubscription;
use crate::mqtt::{BrokerLink, QosLevel};

/// Per-stream forwarding parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub kind: StreamKind,
    /// Local sensor topic to subscribe to
    pub local_topic: String,
    /// Broker topic receiving the encoded frames
    pub broker_topic: String,
    pub qos: QosLevel,
    /// Pause before each frame is processed
    pub throttle: Duration,
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    LimitReached,
    SourceClosed,
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Subscribed, // Local subscription open, no frames consumed yet
    Running,    // Consuming frames
    Finished,   // Loop left, subscription not yet released
}

#[machine]
pub struct ForwardWorker<S: WorkerState> {
    settings: StreamSettings,
    generation: u64,
    session: Arc<Mutex<ForwardingSession>>,
    link: Arc<dyn BrokerLink>,
    subscription: SensorSubscription,
    shutdown: CancellationToken,
    exit: WorkerExit,
}

impl<S: WorkerState> ForwardWorker<S> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> StreamKind {
        self.settings.kind
    }
}

impl ForwardWorker<Subscribed> {
    pub fn create(
        settings: StreamSettings,
        generation: u64,
        session: Arc<Mutex<ForwardingSession>>,
        link: Arc<dyn BrokerLink>,
        subscription: SensorSubscription,
        shutdown: CancellationToken,
    ) -> Self {
        debug!(
            "Creating {} worker for generation {}",
            settings.kind, generation
        );
        Self::new(
            settings,
            generation,
            session,
            link,
            subscription,
            shutdown,
            WorkerExit::Stopped,
        )
    }

    pub fn activate(self) -> ForwardWorker<Running> {
        info!(
            "Forwarding {} from {} to {}",
            self.settings.kind,
            self.subscription.topic(),
            self.settings.broker_topic
        );
        self.transition()
    }
}

impl ForwardWorker<Running> {
    /// Consumes frames until `stop` fires, the session completes or the
    /// source goes away.
    pub async fn run_until_stopped(mut self, stop: CancellationToken) -> ForwardWorker<Finished> {
        let kind = self.settings.kind;

        loop {
            let frame = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Stop signal received for {} worker", kind);
                    self.exit = WorkerExit::Stopped;
                    break;
                }
                frame = self.subscription.recv() => frame,
            };

            let Some(frame) = frame else {
                warn!("Local topic {} closed", self.subscription.topic());
                self.exit = WorkerExit::SourceClosed;
                break;
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Stop signal received for {} worker", kind);
                    self.exit = WorkerExit::Stopped;
                    break;
                }
                _ = tokio::time::sleep(self.settings.throttle) => {}
            }

            match self.forward_frame(&frame, &stop).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.exit = WorkerExit::Stopped;
                    break;
                }
                Err(e) => error!("Error occurs when forwarding {}: {}", kind, e),
            }

            if let Some(exit) = self.check_completion().await {
                self.exit = exit;
                break;
            }
        }

        self.transition()
    }

    /// Publishes one frame. `Ok(None)` means the session is no longer ours,
    /// either before the publish or because `stop` fired while it was pending.
    ///
    /// The session lock is not held across the publish. The generation is
    /// checked again afterwards, so a frame that raced a stop is not counted.
    async fn forward_frame(
        &mut self,
        frame: &SensorFrame,
        stop: &CancellationToken,
    ) -> Result<Option<u64>, ForwardError> {
        if !self.session.lock().await.accepts(self.generation) {
            return Ok(None);
        }

        let payload = self.settings.kind.encode(frame)?;
        let size = payload.len();
        let publish = self
            .link
            .publish(Some(&self.settings.broker_topic), payload, self.settings.qos);
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("{} publish abandoned on stop", self.settings.kind);
                return Ok(None);
            }
            published = publish => published?,
        }

        let mut session = self.session.lock().await;
        if !session.accepts(self.generation) {
            return Ok(None);
        }
        let count = session.record_forward();
        debug!(
            "Forwarded {} {} with payload size {}",
            self.settings.kind, count, size
        );
        Ok(Some(count))
    }

    async fn check_completion(&mut self) -> Option<WorkerExit> {
        let mut session = self.session.lock().await;
        if !session.accepts(self.generation) {
            return Some(WorkerExit::Stopped);
        }
        if !session.finish_if_complete(self.generation) {
            return None;
        }

        info!(
            "Forwarded {} {} frames, unsubscribing from {}",
            session.forwarded_count(),
            self.settings.kind,
            self.subscription.topic()
        );
        if session.completion() == CompletionPolicy::ShutdownProcess {
            info!("{} forwarding complete, requesting shutdown", self.settings.kind);
            self.shutdown.cancel();
        }
        Some(WorkerExit::LimitReached)
    }
}

impl ForwardWorker<Finished> {
    /// Drops the local subscription and reports why the worker ended.
    pub fn release(self) -> WorkerExit {
        let exit = self.exit;
        debug!(
            "{} worker for generation {} finished: {:?}",
            self.settings.kind, self.generation, exit
        );
        self.subscription.unregister();
        exit
    }
}
