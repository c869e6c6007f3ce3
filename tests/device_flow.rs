//! Drives the device the way the remote host does: commands arrive through
//! the connection handler, frames through the local bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vibot_bridge::config::BridgeConfig;
use vibot_bridge::device::{
    CommandError, CommandRouter, DeviceHandler, Heartbeat, ResponseMessage, VioService,
};
use vibot_bridge::forwarder::{
    decode_point_cloud, Image, LocalBus, PointCloud, SensorFrame, SessionPhase, StreamForwarder,
    StreamKind,
};
use vibot_bridge::mqtt::{BrokerLink, CommandMessage, ConnectionError, InboundHandler, QosLevel};

#[derive(Default)]
struct Broker {
    published: Mutex<Vec<(String, String)>>,
    subscribed: Mutex<Vec<String>>,
}

impl Broker {
    fn on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerLink for Broker {
    async fn publish(
        &self,
        topic: Option<&str>,
        payload: String,
        _qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        let topic = topic.unwrap_or("/iot_device/command").to_string();
        self.published.lock().push((topic, payload));
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

struct VioUp;

#[async_trait]
impl VioService for VioUp {
    async fn set_enabled(&self, _enabled: bool) -> Result<u16, CommandError> {
        Ok(200)
    }
}

struct Harness {
    broker: Arc<Broker>,
    bus: LocalBus,
    handler: DeviceHandler,
    router: Arc<CommandRouter>,
    shutdown: CancellationToken,
    router_task: tokio::task::JoinHandle<()>,
}

fn harness(config: BridgeConfig) -> Harness {
    let broker = Arc::new(Broker::default());
    let link: Arc<dyn BrokerLink> = broker.clone();
    let bus = LocalBus::new();
    let shutdown = CancellationToken::new();

    let forwarder = |kind: StreamKind| {
        let stream = config.stream(kind);
        Arc::new(StreamForwarder::new(
            stream.settings(kind),
            stream.limit,
            stream.completion(),
            Arc::new(bus.clone()),
            link.clone(),
            shutdown.clone(),
        ))
    };
    let router = Arc::new(CommandRouter::new(
        link.clone(),
        config.topics.clone(),
        Arc::new(VioUp),
        forwarder(StreamKind::PointCloud),
        forwarder(StreamKind::Image),
        shutdown.clone(),
    ));

    let (tx, rx) = mpsc::channel(16);
    let heartbeat = Heartbeat::new(link.clone(), &config.topics.heartbeat, &config.heartbeat);
    let handler = DeviceHandler::new(link, config.topics.clone(), tx, heartbeat, shutdown.clone());

    let router_task = tokio::spawn({
        let router = router.clone();
        let cancel = shutdown.clone();
        async move { router.run(rx, cancel).await }
    });

    Harness {
        broker,
        bus,
        handler,
        router,
        shutdown,
        router_task,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn points(i: usize) -> PointCloud {
    let v = i as f32;
    PointCloud::from_tuples(&[(v, v + 1.0, v + 2.0)])
}

#[tokio::test(start_paused = true)]
async fn start_command_forwards_until_limit() {
    let mut config = BridgeConfig::default();
    config.point_cloud.limit = 3;
    let h = harness(config);

    h.handler.on_connect().await;
    settle().await;
    assert_eq!(
        *h.broker.subscribed.lock(),
        vec!["/iot_device/status_check", "/iot_device/command"]
    );

    h.handler
        .msg_process(CommandMessage::from_topic(
            "/iot_device/command",
            "start_point_cloud_transfer",
        ))
        .await;
    settle().await;

    let responses = h.broker.on("/iot_device/command_response");
    let response: ResponseMessage = serde_json::from_str(&responses[0]).unwrap();
    assert_eq!(response, ResponseMessage::new("start_point_cloud_transfer", 200));

    for i in 0..5 {
        h.bus.publish("/PR_BE/point_cloud", SensorFrame::PointCloud(points(i)));
        settle().await;
    }

    let forwarded = h.broker.on("/data/point_cloud");
    assert_eq!(forwarded.len(), 3);
    assert_eq!(decode_point_cloud(&forwarded[0]).unwrap(), points(0));
    assert_eq!(decode_point_cloud(&forwarded[2]).unwrap(), points(2));

    let status = h.router.forwarder(StreamKind::PointCloud).status().await;
    assert_eq!(status.phase, SessionPhase::StoppedByLimit);
    assert_eq!(status.forwarded_count, 3);
    assert_eq!(h.bus.subscriber_count("/PR_BE/point_cloud"), 0);
    assert!(!h.shutdown.is_cancelled());

    h.shutdown.cancel();
    h.router_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn status_and_unknown_commands() {
    let h = harness(BridgeConfig::default());

    for payload in ["status_check", "foo", "enable_vio_service"] {
        h.handler
            .msg_process(CommandMessage::from_topic("/iot_device/status_check", payload))
            .await;
    }
    settle().await;

    assert_eq!(h.broker.on("/iot_device/status_response"), vec!["status_ok"]);
    assert_eq!(
        h.broker.on("/iot_device/command_response"),
        vec![r#"{"type":"enable_vio","code":200}"#]
    );
    assert_eq!(h.broker.published.lock().len(), 2);

    h.shutdown.cancel();
    h.router_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn completion_can_shut_the_device_down() {
    let mut config = BridgeConfig::default();
    config.image.limit = 1;
    config.image.exit_on_complete = true;
    let h = harness(config);

    h.handler
        .msg_process(CommandMessage::from_topic(
            "/iot_device/command",
            "start_image_transfer",
        ))
        .await;
    settle().await;

    h.bus.publish(
        "/PR_BE/image",
        SensorFrame::Image(Image {
            height: 1,
            width: 2,
            encoding: "mono8".to_string(),
            step: 2,
            data: vec![0x0a, 0xff],
        }),
    );
    settle().await;

    assert_eq!(h.broker.on("/data/img"), vec!["0aff"]);
    assert!(h.shutdown.is_cancelled());
    h.router_task.await.unwrap();
    assert_eq!(h.bus.subscriber_count("/PR_BE/image"), 0);
}
