use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{Command, ResponseMessage, CODE_OK, STATUS_OK};
use super::error::CommandError;
use super::vio::{VioService, CODE_UNAVAILABLE};
use crate::forwarder::{StreamForwarder, StreamKind};
use crate::mqtt::{BrokerLink, CommandMessage, QosLevel};

/// Broker topics the device listens and answers on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTopics {
    pub command: String,
    pub status_check: String,
    pub status_response: String,
    pub command_response: String,
    pub heartbeat: String,
}

impl Default for DeviceTopics {
    fn default() -> Self {
        Self {
            command: "/iot_device/command".to_string(),
            status_check: "/iot_device/status_check".to_string(),
            status_response: "/iot_device/status_response".to_string(),
            command_response: "/iot_device/command_response".to_string(),
            heartbeat: "/iot_device/heartbeat".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(Command),
    /// Payload matched no command; nothing was published
    Ignored(String),
}

/// Turns inbound command payloads into actions and responses.
pub struct CommandRouter {
    link: Arc<dyn BrokerLink>,
    topics: DeviceTopics,
    vio: Arc<dyn VioService>,
    point_cloud: Arc<StreamForwarder>,
    image: Arc<StreamForwarder>,
    shutdown: CancellationToken,
    exit_on_stop_command: bool,
}

impl CommandRouter {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        topics: DeviceTopics,
        vio: Arc<dyn VioService>,
        point_cloud: Arc<StreamForwarder>,
        image: Arc<StreamForwarder>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            link,
            topics,
            vio,
            point_cloud,
            image,
            shutdown,
            exit_on_stop_command: false,
        }
    }

    /// When set, every `end_*_transfer` command also shuts the process down.
    pub fn with_exit_on_stop_command(mut self, exit: bool) -> Self {
        self.exit_on_stop_command = exit;
        self
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn forwarder(&self, kind: StreamKind) -> &Arc<StreamForwarder> {
        match kind {
            StreamKind::PointCloud => &self.point_cloud,
            StreamKind::Image => &self.image,
        }
    }

    /// Handles one inbound message. Only the payload selects the command,
    /// the topic it arrived on is not consulted.
    pub async fn dispatch(&self, msg: &CommandMessage) -> Result<DispatchOutcome, CommandError> {
        debug!("Processing message {}", msg.render());

        let command = match msg.payload.parse::<Command>() {
            Ok(command) => command,
            Err(CommandError::Unknown(payload)) => {
                warn!("Received unknown message: {}", payload);
                return Ok(DispatchOutcome::Ignored(payload));
            }
            Err(e) => return Err(e),
        };

        match command {
            Command::StatusCheck => {
                self.link
                    .publish(
                        Some(&self.topics.status_response),
                        STATUS_OK.to_string(),
                        QosLevel::AtMostOnce,
                    )
                    .await?;
                debug!("Sent {} to {}", STATUS_OK, self.topics.status_response);
            }
            Command::EnableVio | Command::DisableVio => {
                let code = self.switch_vio(command == Command::EnableVio).await;
                self.respond(command, code).await?;
            }
            Command::StartTransfer(kind) => {
                self.respond(command, CODE_OK).await?;
                self.forwarder(kind).start_forwarding().await?;
                info!("Started {} transfer", kind);
            }
            Command::EndTransfer(kind) => {
                self.respond(command, CODE_OK).await?;
                self.forwarder(kind).stop_forwarding().await;
                info!("Stopped {} transfer", kind);
                if self.exit_on_stop_command {
                    info!("Shutting down after {}", command);
                    self.shutdown.cancel();
                }
            }
        }
        Ok(DispatchOutcome::Handled(command))
    }

    async fn switch_vio(&self, enabled: bool) -> u16 {
        match self.vio.set_enabled(enabled).await {
            Ok(code) => code,
            Err(e) => {
                error!("Vio service unreachable: {}", e);
                CODE_UNAVAILABLE
            }
        }
    }

    async fn respond(&self, command: Command, code: u16) -> Result<(), CommandError> {
        let Some(kind) = command.response_type() else {
            return Ok(());
        };
        let payload = ResponseMessage::new(kind, code).to_json()?;
        self.link
            .publish(
                Some(&self.topics.command_response),
                payload,
                QosLevel::AtMostOnce,
            )
            .await?;
        debug!("Sent {} response to {}", kind, self.topics.command_response);
        Ok(())
    }

    /// Dispatches messages from `inbox` in arrival order until `cancel` fires
    /// or every sender is gone, then stops both forwarders.
    pub async fn run(&self, mut inbox: mpsc::Receiver<CommandMessage>, cancel: CancellationToken) {
        info!("Command router running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = self.dispatch(&msg).await {
                        error!("Command {} failed: {}", msg, e);
                    }
                }
            }
        }
        self.point_cloud.stop_forwarding().await;
        self.image.stop_forwarding().await;
        info!("Command router stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::forwarder::{
        CompletionPolicy, LocalBus, PointCloud, SensorFrame, SessionPhase, StreamSettings,
    };
    use crate::testing::{wait_until, RecordingLink, WarningLog};
    use tracing_subscriber::layer::SubscriberExt;

    const RESPONSES: &str = "/iot_device/command_response";

    struct StubVio {
        code: Option<u16>,
        calls: AtomicUsize,
    }

    impl StubVio {
        fn answering(code: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                code,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VioService for StubVio {
        async fn set_enabled(&self, _enabled: bool) -> Result<u16, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.code
                .ok_or_else(|| CommandError::VioUnavailable("connection refused".to_string()))
        }
    }

    struct Fixture {
        bus: LocalBus,
        link: Arc<RecordingLink>,
        shutdown: CancellationToken,
        router: CommandRouter,
    }

    fn forwarder(
        kind: StreamKind,
        local: &str,
        remote: &str,
        bus: &LocalBus,
        link: &Arc<RecordingLink>,
        shutdown: &CancellationToken,
    ) -> Arc<StreamForwarder> {
        Arc::new(StreamForwarder::new(
            StreamSettings {
                kind,
                local_topic: local.to_string(),
                broker_topic: remote.to_string(),
                qos: QosLevel::ExactlyOnce,
                throttle: Duration::from_millis(10),
            },
            1000,
            CompletionPolicy::StopStream,
            Arc::new(bus.clone()),
            link.clone(),
            shutdown.clone(),
        ))
    }

    fn fixture(vio: Arc<StubVio>) -> Fixture {
        let bus = LocalBus::new();
        let link = Arc::new(RecordingLink::default());
        let shutdown = CancellationToken::new();
        let point_cloud = forwarder(
            StreamKind::PointCloud,
            "/PR_BE/point_cloud",
            "/data/point_cloud",
            &bus,
            &link,
            &shutdown,
        );
        let image = forwarder(
            StreamKind::Image,
            "/PR_BE/image",
            "/data/img",
            &bus,
            &link,
            &shutdown,
        );
        let router = CommandRouter::new(
            link.clone(),
            DeviceTopics::default(),
            vio,
            point_cloud,
            image,
            shutdown.clone(),
        );
        Fixture {
            bus,
            link,
            shutdown,
            router,
        }
    }

    fn command(payload: &str) -> CommandMessage {
        CommandMessage::from_topic("/iot_device/command", payload)
    }

    fn response(link: &RecordingLink, index: usize) -> ResponseMessage {
        serde_json::from_str(&link.published_on(RESPONSES)[index].payload).unwrap()
    }

    #[tokio::test]
    async fn status_check_answers_status_ok() {
        let f = fixture(StubVio::answering(Some(200)));
        let outcome = f.router.dispatch(&command("status_check")).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Handled(Command::StatusCheck));
        let published = f.link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/iot_device/status_response");
        assert_eq!(published[0].payload, "status_ok");
    }

    #[tokio::test]
    async fn status_check_topic_is_dispatched_by_payload() {
        let f = fixture(StubVio::answering(Some(200)));
        let msg = CommandMessage::from_topic("/iot_device/status_check", "status_check");
        f.router.dispatch(&msg).await.unwrap();
        assert_eq!(f.link.count_on("/iot_device/status_response"), 1);
    }

    #[tokio::test]
    async fn unknown_command_publishes_nothing_and_warns_once() {
        let warnings = WarningLog::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

        let f = fixture(StubVio::answering(Some(200)));
        let outcome = f.router.dispatch(&command("foo")).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Ignored("foo".to_string()));
        assert!(f.link.published().is_empty());
        assert_eq!(warnings.messages(), vec!["Received unknown message: foo"]);
    }

    #[tokio::test]
    async fn vio_commands_report_service_code() {
        let vio = StubVio::answering(Some(200));
        let f = fixture(vio.clone());

        f.router.dispatch(&command("enable_vio_service")).await.unwrap();
        f.router.dispatch(&command("disable_vio_service")).await.unwrap();

        assert_eq!(vio.calls.load(Ordering::SeqCst), 2);
        assert_eq!(response(&f.link, 0), ResponseMessage::new("enable_vio", 200));
        assert_eq!(response(&f.link, 1), ResponseMessage::new("disable_vio", 200));
    }

    #[tokio::test]
    async fn vio_failure_codes_are_passed_through() {
        let f = fixture(StubVio::answering(Some(500)));
        f.router.dispatch(&command("enable_vio_service")).await.unwrap();
        assert_eq!(response(&f.link, 0), ResponseMessage::new("enable_vio", 500));
    }

    #[tokio::test]
    async fn unreachable_vio_reports_unavailable() {
        let f = fixture(StubVio::answering(None));
        f.router.dispatch(&command("disable_vio_service")).await.unwrap();
        assert_eq!(
            response(&f.link, 0),
            ResponseMessage::new("disable_vio", CODE_UNAVAILABLE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_responds_before_forwarding() {
        let f = fixture(StubVio::answering(Some(200)));
        f.router
            .dispatch(&command("start_point_cloud_transfer"))
            .await
            .unwrap();

        assert_eq!(
            response(&f.link, 0),
            ResponseMessage::new("start_point_cloud_transfer", 200)
        );
        assert_eq!(f.bus.subscriber_count("/PR_BE/point_cloud"), 1);

        f.bus.publish(
            "/PR_BE/point_cloud",
            SensorFrame::PointCloud(PointCloud::from_tuples(&[(1.0, 2.0, 3.0)])),
        );
        wait_until(|| f.link.count_on("/data/point_cloud") == 1).await;

        let topics: Vec<String> = f.link.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec![RESPONSES.to_string(), "/data/point_cloud".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn end_stops_forwarding_and_keeps_process_running() {
        let f = fixture(StubVio::answering(Some(200)));
        f.router.dispatch(&command("start_image_transfer")).await.unwrap();
        f.router.dispatch(&command("end_image_transfer")).await.unwrap();

        assert_eq!(
            response(&f.link, 1),
            ResponseMessage::new("end_image_transfer", 200)
        );
        assert_eq!(f.bus.subscriber_count("/PR_BE/image"), 0);
        let status = f.router.forwarder(StreamKind::Image).status().await;
        assert_eq!(status.phase, SessionPhase::Idle);
        assert!(!f.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn end_can_request_shutdown() {
        let f = fixture(StubVio::answering(Some(200)));
        let router = f.router.with_exit_on_stop_command(true);
        router
            .dispatch(&command("end_point_cloud_transfer"))
            .await
            .unwrap();
        assert!(f.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_inbox_and_stops_forwarders_on_exit() {
        let f = fixture(StubVio::answering(Some(200)));
        let router = Arc::new(f.router);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let router = router.clone();
            let cancel = cancel.clone();
            async move { router.run(rx, cancel).await }
        });

        tx.send(command("start_point_cloud_transfer")).await.unwrap();
        tx.send(command("status_check")).await.unwrap();
        wait_until(|| f.link.count_on("/iot_device/status_response") == 1).await;
        assert_eq!(f.bus.subscriber_count("/PR_BE/point_cloud"), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.bus.subscriber_count("/PR_BE/point_cloud"), 0);
    }
}
