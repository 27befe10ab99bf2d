//! Orchestrates every subsystem: the upstream MQTT bridge, southbound
//! server(s), the session/device registries, the correlation store, and the
//! event bus wiring between them.
//!
//! Grounded on `original_source/gateway.go` (`sagooIotGateway::Run`) and
//! `events/pushEvents.go` (`LoadingPublishEvent`'s built-in listener
//! registration), translated from that file's package-level globals into one
//! owned struct.

use crate::config::{GatewayConfig, NetType};
use crate::correlation::CorrelationStore;
use crate::device::DeviceRegistry;
use crate::error::GatewayError;
use crate::events::{EventBus, Priority};
use crate::framing::Framer;
use crate::heartbeat;
use crate::mqtt::bridge::{property_topic, service_topic_filter, set_topic_filter, MqttBridge};
use crate::mqtt::dispatcher::{self, MessageKind};
use crate::mqtt::envelope::{build_sub_device, GatewayBatchReqBuilder};
use crate::protocol::ProtocolHandler;
use crate::session::SessionRegistry;
use crate::southbound;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// All live subsystems, owned for the lifetime of the process.
pub struct Gateway {
    config: GatewayConfig,
    bridge: Arc<Mutex<MqttBridge>>,
    sessions: Arc<SessionRegistry>,
    devices: Arc<DeviceRegistry>,
    correlation: Arc<CorrelationStore>,
    bus: Arc<EventBus>,
}

impl Gateway {
    /// Connects to the broker, wires the built-in event listeners, and
    /// returns a gateway ready for `run`. `handler_factory` receives the
    /// gateway's event bus so a `ProtocolHandler` that needs to fire events
    /// (e.g. `PushAttributeDataToMQTT`) can hold onto the same bus instance
    /// the gateway dispatches on.
    pub async fn new(
        config: GatewayConfig,
        handler_factory: impl FnOnce(Arc<EventBus>) -> Arc<dyn ProtocolHandler>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, GatewayError> {
        let last_will_topic =
            property_topic(&config.server.product_key, &config.server.device_key);
        let last_will_payload = serde_json::to_vec(&json!({
            "Status": 1,
        }))
        .unwrap_or_default();

        let bridge = MqttBridge::connect(
            &config.mqtt,
            last_will_topic,
            last_will_payload,
            cancel.clone(),
        )
        .await?;
        let bridge = Arc::new(Mutex::new(bridge));

        let sessions = SessionRegistry::new(
            config.server.read_timeout(),
            config.server.cleanup_interval(),
        );
        let devices = DeviceRegistry::new();
        let correlation = CorrelationStore::new();
        let bus = EventBus::new();
        let handler = handler_factory(bus.clone());

        let gateway = Arc::new(Self {
            config,
            bridge,
            sessions,
            devices,
            correlation,
            bus,
        });

        gateway.register_builtin_listeners();
        gateway.spawn_background_tasks(handler, cancel.clone());

        Ok(gateway)
    }

    fn register_builtin_listeners(self: &Arc<Self>) {
        let publish = self.publish_handle();
        dispatcher::register_reply_listeners(&self.bus, self.correlation.clone(), publish);

        let gateway = self.clone();
        self.bus.on(
            "PushAttributeDataToMQTT",
            Priority::Normal,
            Arc::new(move |payload| gateway.push_attribute_data(payload)),
        );

        let gateway = self.clone();
        self.bus.on(
            "device_attached",
            Priority::Normal,
            Arc::new(move |payload| gateway.on_device_attached(payload)),
        );

        let gateway = self.clone();
        self.bus.on(
            "getGatewayVersion",
            Priority::Normal,
            Arc::new(move |payload| gateway.reply_gateway_version(payload)),
        );

        let gateway = self.clone();
        self.bus.on(
            "getGatewayConfig",
            Priority::Normal,
            Arc::new(move |payload| gateway.reply_gateway_config(payload)),
        );
    }

    fn publish_handle(&self) -> Arc<dyn Fn(String, Vec<u8>) + Send + Sync> {
        let bridge = self.bridge.clone();
        Arc::new(move |topic, payload| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.lock().await.publish(&topic, payload).await {
                    error!(topic, error = %e, "failed to publish");
                }
            });
        })
    }

    fn push_attribute_data(&self, payload: &Value) -> Result<(), String> {
        let device_key = payload
            .get("DeviceKey")
            .and_then(Value::as_str)
            .ok_or_else(|| "PushAttributeDataToMQTT payload missing DeviceKey".to_string())?;

        let properties = payload.get("PropertieDataList").cloned().unwrap_or(Value::Null);
        let events = payload.get("EventDataList").cloned().unwrap_or(Value::Null);
        let sub_device =
            build_sub_device(&self.config.server.product_key, device_key, properties, events);

        let batch = GatewayBatchReqBuilder::new()
            .id(Uuid::new_v4().to_string())
            .version("1.0")
            .add_sub_device(sub_device)
            .build();

        let body = serde_json::to_vec(&batch).map_err(|e| e.to_string())?;
        let topic = property_topic(&self.config.server.product_key, device_key);
        (self.publish_handle())(topic, body);
        Ok(())
    }

    fn on_device_attached(self: &Arc<Self>, payload: &Value) -> Result<(), String> {
        let device_key = payload
            .get("DeviceKey")
            .and_then(Value::as_str)
            .ok_or_else(|| "device_attached payload missing DeviceKey".to_string())?
            .to_string();

        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let bridge = bridge.lock().await;
            if let Err(e) = bridge.subscribe(&service_topic_filter(&device_key)).await {
                warn!(device_key, error = %e, "failed to subscribe to service topic");
            }
            if let Err(e) = bridge.subscribe(&set_topic_filter(&device_key)).await {
                warn!(device_key, error = %e, "failed to subscribe to property-set topic");
            }
        });
        Ok(())
    }

    fn reply_gateway_version(&self, payload: &Value) -> Result<(), String> {
        let device_key = payload
            .get("DeviceKey")
            .and_then(Value::as_str)
            .ok_or_else(|| "getGatewayVersion payload missing DeviceKey".to_string())?;
        self.bus.must_fire(
            "PushServiceResDataToMQTT",
            json!({
                "DeviceKey": device_key,
                "ReplyData": { "Version": env!("CARGO_PKG_VERSION") },
            }),
        )
    }

    fn reply_gateway_config(&self, payload: &Value) -> Result<(), String> {
        let device_key = payload
            .get("DeviceKey")
            .and_then(Value::as_str)
            .ok_or_else(|| "getGatewayConfig payload missing DeviceKey".to_string())?;
        let config = serde_json::to_value(&self.config.server).map_err(|e| e.to_string())?;
        self.bus.must_fire(
            "PushServiceResDataToMQTT",
            json!({"DeviceKey": device_key, "ReplyData": config}),
        )
    }

    fn spawn_background_tasks(
        self: &Arc<Self>,
        handler: Arc<dyn ProtocolHandler>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(
            self.sessions
                .clone()
                .run_sweeper(cancel.child_token()),
        );
        tokio::spawn(self.correlation.clone().run_sweeper(cancel.child_token()));

        tokio::spawn(heartbeat::run(
            self.bridge.clone(),
            self.config.server.product_key.clone(),
            self.config.server.device_key.clone(),
            self.devices.clone(),
            self.config.server.heartbeat_duration(),
            cancel.child_token(),
        ));

        let gateway = self.clone();
        tokio::spawn(async move { gateway.run_platform_message_loop().await });

        let gateway = self.clone();
        let handler = handler.clone();
        let southbound_cancel = cancel.child_token();
        tokio::spawn(async move { gateway.run_southbound(handler, southbound_cancel).await });
    }

    async fn run_platform_message_loop(self: Arc<Self>) {
        loop {
            let message = self.bridge.lock().await.recv().await;
            let Some(message) = message else {
                return;
            };

            let kind = if message.topic.ends_with("/property/set") {
                MessageKind::PropertySet
            } else {
                MessageKind::Service
            };

            dispatcher::dispatch(
                kind,
                &message.topic,
                &message.payload,
                &self.bus,
                &self.correlation,
            );
        }
    }

    async fn run_southbound(self: Arc<Self>, handler: Arc<dyn ProtocolHandler>, cancel: CancellationToken) {
        let result = match self.config.server.net_type {
            NetType::Tcp => {
                let framer = match Framer::new(&self.config.server.packet_config) {
                    Ok(framer) => Arc::new(framer),
                    Err(e) => {
                        error!(error = %e, "invalid packet framing configuration");
                        return;
                    }
                };
                southbound::tcp::run(
                    &self.config.server.addr,
                    framer,
                    handler,
                    self.sessions.clone(),
                    self.devices.clone(),
                    self.bus.clone(),
                    self.config.server.read_timeout(),
                    cancel,
                )
                .await
            }
            NetType::Udp => {
                southbound::udp::run(
                    &self.config.server.addr,
                    handler,
                    self.sessions.clone(),
                    self.devices.clone(),
                    self.bus.clone(),
                    self.config.server.read_timeout(),
                    cancel,
                )
                .await
            }
            NetType::Mqtt => {
                southbound::mqtt_tunnel::run(
                    self.bridge.clone(),
                    self.config.server.ser_up_topic.clone(),
                    self.config.server.ser_down_topic.clone(),
                    handler,
                    cancel,
                )
                .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "southbound server exited with an error");
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connects upstream and then blocks until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("gateway running");
        cancel.cancelled().await;
        info!("gateway stopping");
    }
}
