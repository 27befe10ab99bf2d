//! Upstream MQTT bridge: connection, wire envelopes, reconnect bookkeeping,
//! and platform-to-device message dispatch.

pub mod bridge;
pub mod dispatcher;
pub mod envelope;
pub mod reconnect;

pub use bridge::{IncomingMessage, MqttBridge};
pub use dispatcher::{dispatch, device_key_from_topic, register_reply_listeners, MessageKind};
pub use envelope::{GatewayBatchReqBuilder, ServiceCallOutputRes, ServiceCallRequest};
pub use reconnect::{ReconnectStatus, ReconnectSupervisor};
