use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::CommandError;
use super::heartbeat::Heartbeat;
use super::router::{CommandRouter, DeviceTopics};
use super::vio::{HttpVioService, VioService};
use crate::config::BridgeConfig;
use crate::forwarder::{SensorSource, StreamForwarder, StreamKind};
use crate::mqtt::{BrokerConnection, BrokerLink, CommandMessage, ConnectionDriver, InboundHandler};

/// Inbound messages waiting for the router
pub const INBOX_CAPACITY: usize = 32;

/// How long shutdown waits for the disconnect to reach the broker
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection-side half of the device.
///
/// Runs inside the event loop: it resubscribes on every connect and hands
/// inbound messages to the router through a bounded channel, so a slow
/// command never stalls the connection. Subscribes go out from their own
/// task because requests queued during an outage are only drained by the
/// event loop this handler runs on.
pub struct DeviceHandler {
    link: Arc<dyn BrokerLink>,
    topics: DeviceTopics,
    inbox: mpsc::Sender<CommandMessage>,
    heartbeat: Mutex<Option<Heartbeat>>,
    cancel: CancellationToken,
}

impl DeviceHandler {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        topics: DeviceTopics,
        inbox: mpsc::Sender<CommandMessage>,
        heartbeat: Heartbeat,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            topics,
            inbox,
            heartbeat: Mutex::new(Some(heartbeat)),
            cancel,
        }
    }
}

#[async_trait]
impl InboundHandler for DeviceHandler {
    async fn on_connect(&self) {
        let link = self.link.clone();
        let topics = [self.topics.status_check.clone(), self.topics.command.clone()];
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let resubscribe = async {
                for topic in &topics {
                    if let Err(e) = link.subscribe(topic).await {
                        error!("Failed to subscribe to {}: {}", topic, e);
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => debug!("Resubscribe abandoned on shutdown"),
                _ = resubscribe => {}
            }
        });

        // Reconnects reuse the running heartbeat.
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.spawn(self.cancel.child_token());
        }
    }

    async fn msg_process(&self, msg: CommandMessage) {
        match self.inbox.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!("Command inbox full, dropping {:?}", msg.payload);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Command router gone, ignoring message");
            }
        }
    }
}

/// The assembled device: connection, forwarders, router and heartbeat.
pub struct Device {
    connection: BrokerConnection,
    driver: ConnectionDriver,
    driver_cancel: CancellationToken,
    router: Arc<CommandRouter>,
    handler: Arc<DeviceHandler>,
    inbox: mpsc::Receiver<CommandMessage>,
    shutdown: CancellationToken,
}

impl Device {
    /// Wires all components from `config`. Frames are read from `source`;
    /// cancelling `shutdown` stops the device.
    pub fn from_config(
        config: &BridgeConfig,
        source: Arc<dyn SensorSource>,
        shutdown: CancellationToken,
    ) -> Result<Self, CommandError> {
        let vio: Arc<dyn VioService> = Arc::new(HttpVioService::new(config.vio.clone())?);
        Ok(Self::with_vio(config, source, vio, shutdown))
    }

    pub fn with_vio(
        config: &BridgeConfig,
        source: Arc<dyn SensorSource>,
        vio: Arc<dyn VioService>,
        shutdown: CancellationToken,
    ) -> Self {
        let driver_cancel = CancellationToken::new();
        let (connection, driver) = BrokerConnection::new(
            config.broker.clone(),
            config.retry.clone(),
            driver_cancel.clone(),
        );
        let link: Arc<dyn BrokerLink> = Arc::new(connection.clone());

        let forwarder = |kind: StreamKind| {
            let stream = config.stream(kind);
            Arc::new(StreamForwarder::new(
                stream.settings(kind),
                stream.limit,
                stream.completion(),
                source.clone(),
                link.clone(),
                shutdown.clone(),
            ))
        };

        let router = CommandRouter::new(
            link.clone(),
            config.topics.clone(),
            vio,
            forwarder(StreamKind::PointCloud),
            forwarder(StreamKind::Image),
            shutdown.clone(),
        )
        .with_exit_on_stop_command(config.exit_on_stop_command);

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let heartbeat = Heartbeat::new(link.clone(), &config.topics.heartbeat, &config.heartbeat);
        let handler = DeviceHandler::new(
            link,
            config.topics.clone(),
            tx,
            heartbeat,
            shutdown.clone(),
        );

        Self {
            connection,
            driver,
            driver_cancel,
            router: Arc::new(router),
            handler: Arc::new(handler),
            inbox,
            shutdown,
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Runs until the shutdown token fires or the connection gives up, then
    /// stops forwarding and disconnects.
    pub async fn run(self) -> Result<(), CommandError> {
        let Device {
            connection,
            driver,
            driver_cancel,
            router,
            handler,
            inbox,
            shutdown,
        } = self;

        let mut driver_task = tokio::spawn(driver.run(handler));
        let router_task = tokio::spawn({
            let cancel = shutdown.clone();
            async move { router.run(inbox, cancel).await }
        });

        let mut driver_result = None;
        tokio::select! {
            _ = shutdown.cancelled() => info!("Shutdown requested"),
            joined = &mut driver_task => {
                driver_result = Some(joined);
                shutdown.cancel();
            }
        }

        if let Err(e) = router_task.await {
            error!("Command router task failed: {}", e);
        }

        let joined = match driver_result {
            Some(joined) => joined,
            None => {
                // Requests queue up while the broker is unreachable, so the
                // hook itself is bounded too.
                let graceful = async {
                    if let Err(e) = connection.hook().await {
                        warn!("Graceful disconnect failed: {}", e);
                    }
                    (&mut driver_task).await
                };
                match tokio::time::timeout(DISCONNECT_GRACE, graceful).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Broker did not confirm disconnect in time");
                        driver_cancel.cancel();
                        driver_task.await
                    }
                }
            }
        };

        match joined {
            Ok(result) => result.map_err(CommandError::from),
            Err(e) => {
                error!("Connection driver task failed: {}", e);
                Ok(())
            }
        }
    }
}
