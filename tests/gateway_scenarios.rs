//! End-to-end scenarios driving the gateway's public API with loopback TCP
//! and an in-process fake MQTT sink, exercising the bridging path without a
//! real broker.

use async_trait::async_trait;
use iotgateway::config::{PacketConfig, PacketMode};
use iotgateway::correlation::CorrelationStore;
use iotgateway::device::DeviceRegistry;
use iotgateway::error::GatewayError;
use iotgateway::events::{EventBus, Priority};
use iotgateway::framing::Framer;
use iotgateway::mqtt::dispatcher::{self, register_reply_listeners, MessageKind};
use iotgateway::mqtt::envelope::{build_sub_device, GatewayBatchReqBuilder};
use iotgateway::mqtt::reconnect::ReconnectSupervisor;
use iotgateway::protocol::ProtocolHandler;
use iotgateway::session::{Session, SessionRegistry};
use iotgateway::southbound::tcp;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Fires `PushAttributeDataToMQTT` on the first frame, mimicking a device
/// handshake that announces its `deviceKey` followed by a property push.
struct HandshakeHandler {
    bus: Arc<EventBus>,
}

#[async_trait]
impl ProtocolHandler for HandshakeHandler {
    async fn init(&self, session: &Arc<Session>, frame: &[u8]) -> Result<(), GatewayError> {
        if session.device_key().is_none() {
            let text = String::from_utf8_lossy(frame);
            let device_key = text.trim().trim_start_matches("hello").trim();
            let device_key = if device_key.is_empty() { "D1" } else { device_key };
            session.set_device_key(device_key);
        }
        Ok(())
    }

    async fn encode(
        &self,
        _session: Option<&Arc<Session>>,
        value: &Value,
    ) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(value).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    async fn decode(
        &self,
        session: &Arc<Session>,
        _frame: &[u8],
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let device_key = session.device_key().unwrap_or_default();
        self.bus
            .must_fire(
                "PushAttributeDataToMQTT",
                json!({"DeviceKey": device_key, "PropertieDataList": {"temp": 25}}),
            )
            .map_err(GatewayError::Protocol)?;
        Ok(None)
    }
}

async fn free_tcp_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn delimiter_framing_attribute_push_publishes_expected_envelope() {
    let addr = free_tcp_addr().await;
    let bus = EventBus::new();
    let sessions = SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(60));
    let devices = DeviceRegistry::new();
    let framer = Arc::new(
        Framer::new(&PacketConfig {
            mode: PacketMode::Delimiter,
            fixed_length: 0,
            header_length: 4,
            delimiter: "\r\n".to_string(),
        })
        .unwrap(),
    );
    let handler = Arc::new(HandshakeHandler { bus: bus.clone() });

    let published: Arc<Mutex<Option<(String, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let published2 = published.clone();
    bus.on(
        "PushAttributeDataToMQTT",
        Priority::Normal,
        Arc::new(move |payload| {
            let device_key = payload["DeviceKey"].as_str().unwrap();
            let sub_device = build_sub_device(
                "P",
                device_key,
                payload["PropertieDataList"].clone(),
                json!({}),
            );
            let batch = GatewayBatchReqBuilder::new()
                .id("batch-1")
                .version("1.0")
                .add_sub_device(sub_device)
                .build();
            let body = serde_json::to_vec(&batch).unwrap();
            let topic = format!("/sys/P/{device_key}/thing/event/property/pack/post");
            *published2.lock().unwrap() = Some((topic, body));
            Ok(())
        }),
    );

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        tcp::run(
            &addr,
            framer,
            handler,
            sessions,
            devices,
            bus,
            Duration::from_secs(5),
            server_cancel,
        )
        .await
    });

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"hello\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (topic, body) = published.lock().unwrap().clone().expect("no publish captured");
    assert_eq!(topic, "/sys/P/D1/thing/event/property/pack/post");

    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["method"], "thing.event.property.pack.post");
    assert_eq!(
        value["params"]["subDevices"][0]["identity"]["deviceKey"],
        "D1"
    );
    assert_eq!(
        value["params"]["subDevices"][0]["properties"]["temp"]["value"],
        25
    );
    let reported_time = value["params"]["subDevices"][0]["properties"]["temp"]["time"]
        .as_i64()
        .unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!((now - reported_time).abs() <= 2);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[tokio::test]
async fn service_call_round_trip_publishes_reply_on_reply_topic() {
    let bus = EventBus::new();
    let correlation = CorrelationStore::new();

    bus.on(
        "reboot",
        Priority::Normal,
        Arc::new(move |_payload| Ok(())),
    );

    let published: Arc<Mutex<Option<(String, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let published2 = published.clone();
    let publish: Arc<dyn Fn(String, Vec<u8>) + Send + Sync> =
        Arc::new(move |topic, body| *published2.lock().unwrap() = Some((topic, body)));
    register_reply_listeners(&bus, correlation.clone(), publish);

    dispatcher::dispatch(
        MessageKind::Service,
        "/sys/P/D1/thing/service/reboot",
        br#"{"id":"m-7","version":"1.0","params":{"delay":3},"method":"thing.service.reboot"}"#,
        &bus,
        &correlation,
    );

    // The embedder's "reboot" handler eventually answers via PushServiceResDataToMQTT.
    bus.must_fire(
        "PushServiceResDataToMQTT",
        json!({"DeviceKey": "D1", "ReplyData": {"ok": true}}),
    )
    .unwrap();

    let (topic, body) = published.lock().unwrap().clone().expect("no reply published");
    assert_eq!(topic, "/sys/P/D1/thing/service/reboot_reply");

    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["id"], "m-7");
    assert_eq!(value["code"], 200);
    assert_eq!(value["message"], "success");
    assert_eq!(value["version"], "1.0");
    assert_eq!(value["data"]["ok"], true);

    // Service replies do not clear the pending request (only property-set replies do).
    assert!(correlation.get("D1", Some("m-7")).is_some());
}

#[tokio::test]
async fn property_set_reply_clears_the_pending_request() {
    let bus = EventBus::new();
    let correlation = CorrelationStore::new();

    let published: Arc<Mutex<Option<(String, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let published2 = published.clone();
    let publish: Arc<dyn Fn(String, Vec<u8>) + Send + Sync> =
        Arc::new(move |topic, body| *published2.lock().unwrap() = Some((topic, body)));
    register_reply_listeners(&bus, correlation.clone(), publish);

    dispatcher::dispatch(
        MessageKind::PropertySet,
        "/sys/P/D1/thing/service/property/set",
        br#"{"id":"m-8","version":"1.0","params":{"temp":30},"method":"thing.service.property.set"}"#,
        &bus,
        &correlation,
    );
    assert!(correlation.get("D1", Some("m-8")).is_some());

    bus.must_fire("PushSetResDataToMQTT", json!({"DeviceKey": "D1"}))
        .unwrap();

    assert!(published.lock().unwrap().is_some());
    assert!(correlation.get("D1", None).is_none());
    assert!(correlation.get("D1", Some("m-8")).is_none());
}

#[tokio::test]
async fn idle_session_is_evicted_shortly_after_the_read_timeout() {
    let addr = free_tcp_addr().await;
    let bus = EventBus::new();
    let sessions = SessionRegistry::new(Duration::from_millis(100), Duration::from_millis(50));
    let devices = DeviceRegistry::new();
    let framer = Arc::new(
        Framer::new(&PacketConfig {
            mode: PacketMode::Delimiter,
            fixed_length: 0,
            header_length: 4,
            delimiter: "\r\n".to_string(),
        })
        .unwrap(),
    );
    let handler = Arc::new(HandshakeHandler { bus: bus.clone() });

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let sessions_for_assert = sessions.clone();
    let server = tokio::spawn(async move {
        tcp::run(
            &addr,
            framer,
            handler,
            sessions,
            devices,
            bus,
            Duration::from_millis(100),
            server_cancel,
        )
        .await
    });

    let client = TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(sessions_for_assert.len(), 0);
    drop(client);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[test]
fn reconnect_backoff_matches_the_cumulative_retry_schedule() {
    let supervisor = ReconnectSupervisor::new();
    let expected_cumulative = [1u64, 3, 7, 15, 31, 63];
    let mut elapsed = 0u64;
    for expected in expected_cumulative {
        elapsed += supervisor.next_backoff().as_secs();
        assert_eq!(elapsed, expected);
    }

    supervisor.set_connected(true);
    assert_eq!(supervisor.status().current_retry, 0);
}
