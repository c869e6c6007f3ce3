use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::ForwardError;
use super::frames::StreamKind;
use super::session::{CompletionPolicy, ForwardingSession, SessionPhase};
use super::source::SensorSource;
use super::worker::{ForwardWorker, StreamSettings, WorkerExit};
use crate::mqtt::BrokerLink;

/// Point-in-time view of a forwarder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwarderStatus {
    pub kind: StreamKind,
    pub phase: SessionPhase,
    pub forwarded_count: u64,
    pub limit: u64,
}

struct WorkerHandle {
    stop: CancellationToken,
    task: JoinHandle<WorkerExit>,
}

/// Relays one local sensor stream to the broker.
///
/// `start_forwarding` and `stop_forwarding` may be called from any task and
/// in any order; both are serialized on the worker slot.
pub struct StreamForwarder {
    settings: StreamSettings,
    source: Arc<dyn SensorSource>,
    link: Arc<dyn BrokerLink>,
    session: Arc<Mutex<ForwardingSession>>,
    worker: Mutex<Option<WorkerHandle>>,
    shutdown: CancellationToken,
}

impl StreamForwarder {
    /// `shutdown` is the process-wide token: cancelling it stops the worker,
    /// and a `ShutdownProcess` completion cancels it.
    pub fn new(
        settings: StreamSettings,
        limit: u64,
        completion: CompletionPolicy,
        source: Arc<dyn SensorSource>,
        link: Arc<dyn BrokerLink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            source,
            link,
            session: Arc::new(Mutex::new(ForwardingSession::new(limit, completion))),
            worker: Mutex::new(None),
            shutdown,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.settings.kind
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Subscribes the local topic and starts a fresh session.
    ///
    /// A session that is already running is torn down first, so one stream
    /// never holds two subscriptions.
    pub async fn start_forwarding(&self) -> Result<(), ForwardError> {
        let mut slot = self.worker.lock().await;
        if let Some(previous) = slot.take() {
            info!("Restarting {} forwarding", self.settings.kind);
            previous.stop.cancel();
            self.session.lock().await.end();
            Self::join(self.settings.kind, previous).await;
        }

        let subscription = self.source.subscribe(&self.settings.local_topic).await?;
        let generation = self.session.lock().await.begin();

        let worker = ForwardWorker::create(
            self.settings.clone(),
            generation,
            self.session.clone(),
            self.link.clone(),
            subscription,
            self.shutdown.clone(),
        )
        .activate();

        let stop = self.shutdown.child_token();
        let worker_stop = stop.clone();
        let task =
            tokio::spawn(async move { worker.run_until_stopped(worker_stop).await.release() });

        *slot = Some(WorkerHandle { stop, task });
        info!(
            "Started {} forwarding (generation {})",
            self.settings.kind, generation
        );
        Ok(())
    }

    /// Ends the session from any phase and waits for the worker to release
    /// its subscription. Calling it while idle is a no-op.
    ///
    /// The worker is signalled before the session lock is taken, so a
    /// publish stuck on the broker cannot hold the stop up.
    pub async fn stop_forwarding(&self) {
        let mut slot = self.worker.lock().await;
        let handle = slot.take();
        if let Some(handle) = &handle {
            handle.stop.cancel();
        }
        let previous_phase = self.session.lock().await.end();

        match handle {
            Some(handle) => {
                Self::join(self.settings.kind, handle).await;
                info!(
                    "Stopped {} forwarding (was {:?})",
                    self.settings.kind, previous_phase
                );
            }
            None => debug!("{} forwarding already idle", self.settings.kind),
        }
    }

    pub async fn status(&self) -> ForwarderStatus {
        let session = self.session.lock().await;
        ForwarderStatus {
            kind: self.settings.kind,
            phase: session.phase(),
            forwarded_count: session.forwarded_count(),
            limit: session.limit(),
        }
    }

    async fn join(kind: StreamKind, handle: WorkerHandle) {
        handle.stop.cancel();
        match handle.task.await {
            Ok(exit) => debug!("{} worker exited: {:?}", kind, exit),
            Err(e) => error!("{} worker panicked: {}", kind, e),
        }
    }
}
