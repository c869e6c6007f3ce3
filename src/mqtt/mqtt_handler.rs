//! Broker connection lifecycle
//!
//! Splits the rumqttc client into two halves:
//!
//! - [`BrokerConnection`] is the cheap, cloneable handle used by every
//!   component that publishes or subscribes. It implements [`BrokerLink`].
//! - [`ConnectionDriver`] owns the rumqttc event loop. It retries failed
//!   connects with a fixed backoff, reconnects after link loss and hands
//!   inbound messages to an [`InboundHandler`].
//!
//! ```text
//! StreamForwarder ─┐
//! CommandRouter ───┼─► BrokerConnection ─[requests]─► ConnectionDriver ─► broker
//! Heartbeat ───────┘                                        │
//!                                     InboundHandler ◄──────┘ (ConnAck, Publish)
//! ```
//!
//! Connection bookkeeping lives in a `watch` channel so callers can wait for
//! the first successful connect without polling.

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionConfig, QosLevel, RetryPolicy};
use super::error::ConnectionError;
use super::message_manager::CommandMessage;

/// Result code recorded when the broker never answered the attempt.
pub const TRANSPORT_FAILURE: i32 = -1;

const REQUEST_CAPACITY: usize = 100;

/// Publish and subscription capability shared by forwarders, router and heartbeat.
///
/// Calls are fire-and-forget: they only queue the request for the event loop.
/// While the broker is unreachable requests wait in that queue, so callers
/// must not rely on delivery.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Publishes `payload`; a missing or empty topic means the configured default topic.
    async fn publish(
        &self,
        topic: Option<&str>,
        payload: String,
        qos: QosLevel,
    ) -> Result<(), ConnectionError>;

    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    /// Unsubscribes `topic`, or the configured default topic when `None`.
    async fn unsubscribe(&self, topic: Option<&str>) -> Result<(), ConnectionError>;
}

/// Receives connection events from the [`ConnectionDriver`].
///
/// Both hooks run inside the event loop task, so they must return quickly.
/// That task is the only one draining the client's request queue: a hook
/// must never await a broker request itself, it spawns it instead.
/// The defaults ignore everything.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Called after every successful connect, including reconnects.
    async fn on_connect(&self) {}

    /// Called once per inbound publish.
    async fn msg_process(&self, msg: CommandMessage) {
        let _ = msg;
    }
}

/// Handler that ignores all inbound traffic
pub struct NoopHandler;

impl InboundHandler for NoopHandler {}

/// How a single connect attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted,
    /// The broker answered with a non-success CONNACK
    Refused(ConnectReturnCode),
    /// No usable answer: socket, TLS or protocol failure
    Transport(String),
}

impl ConnectOutcome {
    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ConnectOutcome::Accepted,
            other => ConnectOutcome::Refused(other),
        }
    }

    /// Numeric MQTT 3.1.1 result code, [`TRANSPORT_FAILURE`] when there is none.
    pub fn result_code(&self) -> i32 {
        match self {
            ConnectOutcome::Accepted => 0,
            ConnectOutcome::Refused(code) => match code {
                ConnectReturnCode::Success => 0,
                ConnectReturnCode::RefusedProtocolVersion => 1,
                ConnectReturnCode::BadClientId => 2,
                ConnectReturnCode::ServiceUnavailable => 3,
                ConnectReturnCode::BadUserNamePassword => 4,
                ConnectReturnCode::NotAuthorized => 5,
            },
            ConnectOutcome::Transport(_) => TRANSPORT_FAILURE,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectOutcome::Accepted)
    }
}

impl From<&rumqttc::ConnectionError> for ConnectOutcome {
    fn from(err: &rumqttc::ConnectionError) -> Self {
        match err {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                ConnectOutcome::from_return_code(*code)
            }
            other => ConnectOutcome::Transport(other.to_string()),
        }
    }
}

/// What the driver does after the link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    Reconnect,
    Stop,
}

/// Connection bookkeeping, mutated only by the connection itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Result code of the last attempt or disconnect, 0 on success
    pub last_result_code: i32,
    /// Failed attempts since the last successful connect
    pub retry_count: u32,
    pub disconnect_requested: bool,
    /// Grows by 2 per failed attempt and resets on connect
    pub timeout: u64,
    /// Set once the driver has terminated
    pub closed: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            last_result_code: TRANSPORT_FAILURE,
            retry_count: 0,
            disconnect_requested: false,
            timeout: 0,
            closed: false,
        }
    }
}

impl ConnectionState {
    /// Returns the number of consecutive failed attempts.
    pub fn record_failed_attempt(&mut self, result_code: i32) -> u32 {
        self.connected = false;
        self.last_result_code = result_code;
        self.retry_count += 1;
        self.timeout += 2;
        self.retry_count
    }

    pub fn record_connected(&mut self) {
        self.connected = true;
        self.last_result_code = 0;
        self.retry_count = 0;
        self.timeout = 0;
    }

    /// Decides whether losing the link should restart the connect loop.
    ///
    /// Only an unrequested disconnect with a non-zero result code reconnects.
    pub fn on_disconnect(&mut self, result_code: i32) -> DisconnectAction {
        self.connected = false;
        self.last_result_code = result_code;
        if self.disconnect_requested || result_code == 0 {
            DisconnectAction::Stop
        } else {
            DisconnectAction::Reconnect
        }
    }

    pub fn request_disconnect(&mut self) {
        self.disconnect_requested = true;
    }
}

/// Cloneable handle to the broker connection.
#[derive(Clone)]
pub struct BrokerConnection {
    client: AsyncClient,
    config: Arc<ConnectionConfig>,
    state: Arc<watch::Sender<ConnectionState>>,
}

/// Owns the rumqttc event loop; run it with [`ConnectionDriver::run`].
pub struct ConnectionDriver {
    eventloop: EventLoop,
    config: Arc<ConnectionConfig>,
    retry: RetryPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl BrokerConnection {
    /// Creates the handle and its driver. Nothing touches the network until
    /// the driver runs.
    pub fn new(
        config: ConnectionConfig,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> (Self, ConnectionDriver) {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), REQUEST_CAPACITY);
        let config = Arc::new(config);
        let (state, _) = watch::channel(ConnectionState::default());
        let state = Arc::new(state);

        let connection = BrokerConnection {
            client,
            config: config.clone(),
            state: state.clone(),
        };
        let driver = ConnectionDriver {
            eventloop,
            config,
            retry,
            state,
            cancel,
        };
        (connection, driver)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn get_timeout(&self) -> u64 {
        self.state.borrow().timeout
    }

    /// Waits until the driver reports a successful connect.
    ///
    /// Fails only when the driver terminates first, i.e. it was cancelled or
    /// exhausted its retry budget.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state.subscribe();
        let connected = rx
            .wait_for(|state| state.connected || state.closed)
            .await
            .map(|state| state.connected)
            .unwrap_or(false);

        if connected {
            Ok(())
        } else {
            Err(ConnectionError::Closed(self.config.broker_addr()))
        }
    }

    /// Closes the connection on purpose; the driver will not reconnect.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        info!("Disconnecting from {}", self.config.broker_addr());
        self.state.send_modify(ConnectionState::request_disconnect);
        self.client.disconnect().await?;
        Ok(())
    }

    /// Graceful shutdown: drop the default subscription, then disconnect.
    pub async fn hook(&self) -> Result<(), ConnectionError> {
        if let Err(e) = self.unsubscribe(None).await {
            warn!("Failed to unsubscribe during shutdown: {}", e);
        }
        self.disconnect().await?;
        info!("Shutting down");
        Ok(())
    }

    fn resolve_topic<'a>(&'a self, topic: Option<&'a str>) -> &'a str {
        resolve_topic(topic, &self.config.topic)
    }
}

fn resolve_topic<'a>(topic: Option<&'a str>, default: &'a str) -> &'a str {
    match topic {
        Some(topic) if !topic.is_empty() => topic,
        _ => default,
    }
}

#[async_trait]
impl BrokerLink for BrokerConnection {
    async fn publish(
        &self,
        topic: Option<&str>,
        payload: String,
        qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        let topic = self.resolve_topic(topic);
        debug!(
            "Publishing {} bytes to topic {} (qos {})",
            payload.len(),
            topic,
            qos
        );
        self.client
            .publish(topic, qos.into(), false, payload.into_bytes())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        info!("Subscribing to {}", topic);
        self.client.subscribe(topic, self.config.qos.into()).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: Option<&str>) -> Result<(), ConnectionError> {
        let topic = self.resolve_topic(topic);
        info!("Unsubscribing {}", topic);
        self.client.unsubscribe(topic).await?;
        Ok(())
    }
}

impl ConnectionDriver {
    /// Drives the event loop until cancelled, disconnected on request, or the
    /// retry budget runs out.
    pub async fn run(mut self, handler: Arc<dyn InboundHandler>) -> Result<(), ConnectionError> {
        info!(
            "Trying to connect to the broker on {}",
            self.config.broker_addr()
        );
        let result = self.drive(handler.as_ref()).await;
        self.state.send_modify(|state| {
            state.connected = false;
            state.closed = true;
        });
        if let Err(e) = &result {
            error!("Connection driver terminated: {}", e);
        }
        result
    }

    async fn drive(&mut self, handler: &dyn InboundHandler) -> Result<(), ConnectionError> {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Connection driver cancelled");
                    return Ok(());
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    let outcome = ConnectOutcome::from_return_code(ack.code);
                    if outcome.is_accepted() {
                        self.state.send_modify(ConnectionState::record_connected);
                        info!(
                            "Connected to MQTT broker {} with result code 0",
                            self.config.broker_addr()
                        );
                        handler.on_connect().await;
                    } else if self.attempt_failed(outcome).await?.is_break() {
                        return Ok(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = CommandMessage::from_publish(&publish.topic, &publish.payload);
                    debug!("Received message on topic {}", msg.topic);
                    handler.msg_process(msg).await;
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => debug!("Subscribed"),
                Ok(Event::Incoming(Packet::UnsubAck(_))) => debug!("Unsubscribed"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    if self.state.borrow().disconnect_requested {
                        self.state.send_modify(|state| {
                            state.on_disconnect(0);
                        });
                        info!("Disconnected from broker on request");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    let outcome = ConnectOutcome::from(&err);
                    let (was_connected, requested) = {
                        let state = self.state.borrow();
                        (state.connected, state.disconnect_requested)
                    };

                    if was_connected {
                        let mut action = DisconnectAction::Stop;
                        self.state.send_modify(|state| {
                            action = state.on_disconnect(outcome.result_code());
                        });
                        match action {
                            DisconnectAction::Stop => {
                                info!("Connection closed: {}", err);
                                return Ok(());
                            }
                            DisconnectAction::Reconnect => {
                                warn!("Unexpected disconnection: {}", err);
                                warn!("Trying reconnection");
                                continue;
                            }
                        }
                    }

                    if requested {
                        return Ok(());
                    }
                    if self.attempt_failed(outcome).await?.is_break() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Books a failed attempt and waits out the backoff.
    ///
    /// Breaks when cancelled during the wait.
    async fn attempt_failed(
        &mut self,
        outcome: ConnectOutcome,
    ) -> Result<ControlFlow<()>, ConnectionError> {
        let code = outcome.result_code();
        let mut attempts = 0;
        self.state.send_modify(|state| {
            attempts = state.record_failed_attempt(code);
        });
        log_connect_hints(&self.config, &outcome, attempts);

        if self.retry.is_exhausted(attempts) {
            return Err(ConnectionError::RetriesExhausted {
                broker: self.config.broker_addr(),
                attempts,
            });
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(ControlFlow::Break(())),
            _ = tokio::time::sleep(self.retry.backoff()) => Ok(ControlFlow::Continue(())),
        }
    }
}

fn log_connect_hints(config: &ConnectionConfig, outcome: &ConnectOutcome, attempts: u32) {
    warn!(
        "Connection to {} failed (attempt {}): {:?}",
        config.broker_addr(),
        attempts,
        outcome
    );
    warn!(
        "1. Check the network connection and that the broker port is an integer (configured {})",
        config.port
    );
    warn!("2. Check the broker's MQTT version; mosquitto 2+ only accepts remote clients on a listener configured for it");
    warn!("3. Last MQTT result code: {}", outcome.result_code());
}
