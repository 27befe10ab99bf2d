//! Routes inbound platform-to-device MQTT messages (service calls and
//! property-set requests) to the in-process event bus, and publishes their
//! replies.
//!
//! Grounded on `original_source/service.go` (`onServiceMessage`) and
//! `original_source/set.go` (`onSetMessage`) — both handlers are
//! structurally identical (parse envelope, stash a `PendingRequest`, fire an
//! event named after the method's third dot-segment) and differ only in
//! which reply event publishes the device's eventual answer, so this module
//! unifies them behind `MessageKind`.

use crate::correlation::{CorrelationStore, PendingRequest};
use crate::events::{EventBus, Priority};
use crate::mqtt::envelope::ServiceCallRequest;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which platform-to-device channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `/sys/+/{deviceKey}/thing/service/#` — `onServiceMessage` in the original.
    Service,
    /// `/sys/+/{deviceKey}/thing/service/property/set` — `onSetMessage` in the original.
    PropertySet,
}

/// Extracts the device key from a topic's third `/`-separated segment, e.g.
/// `/sys/PK/D1/thing/service/foo` -> `D1`.
pub fn device_key_from_topic(topic: &str) -> Option<&str> {
    topic.split('/').nth(3)
}

/// Parses an inbound platform message and fires the corresponding event,
/// recording a `PendingRequest` in `correlation` so the eventual device reply
/// can be matched back to this call.
///
/// Topics ending `_reply` are a gateway's own replies looping back through a
/// broad subscription and are ignored, matching the original's guard.
pub fn dispatch(
    kind: MessageKind,
    topic: &str,
    payload: &[u8],
    bus: &Arc<EventBus>,
    correlation: &Arc<CorrelationStore>,
) {
    if topic.ends_with("_reply") {
        return;
    }

    let Some(device_key) = device_key_from_topic(topic) else {
        warn!(topic, "platform message topic has no device key segment");
        return;
    };

    let request: ServiceCallRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(topic, error = %e, "failed to parse platform message payload");
            return;
        }
    };

    let method_segments: Vec<&str> = request.method.split('.').collect();
    let Some(method_name) = method_segments.get(2) else {
        warn!(method = %request.method, "method string has fewer than 3 dot-segments");
        return;
    };

    correlation.store(
        device_key,
        PendingRequest::new(
            request.id.clone(),
            method_name.to_string(),
            topic.to_string(),
            chrono::Utc::now().timestamp(),
        ),
    );

    let mut params = Value::Object(request.params);
    if let Some(object) = params.as_object_mut() {
        object.insert("DeviceKey".to_string(), Value::String(device_key.to_string()));
    }

    debug!(kind = ?kind, method = %method_name, device_key, "dispatching platform message");

    if let Err(e) = bus.must_fire(method_name, params) {
        warn!(method = %method_name, error = %e, "platform message handler failed");
    }
}

/// Registers the built-in listeners that publish a device's reply back
/// upstream once it answers a service call or property-set request. `publish`
/// is the bridge's outbound publish closure (kept generic here so this module
/// has no direct dependency on `bridge.rs`). Both replies run at `High`
/// priority, matching `LoadingPublishEvent` in the original.
pub fn register_reply_listeners(
    bus: &Arc<EventBus>,
    correlation: Arc<CorrelationStore>,
    publish: Arc<dyn Fn(String, Vec<u8>) + Send + Sync>,
) {
    let correlation_for_service = correlation.clone();
    let publish_for_service = publish.clone();
    bus.on(
        "PushServiceResDataToMQTT",
        Priority::High,
        Arc::new(move |payload| {
            reply_to_pending(payload, &correlation_for_service, &publish_for_service, false)
        }),
    );

    bus.on(
        "PushSetResDataToMQTT",
        Priority::High,
        Arc::new(move |payload| reply_to_pending(payload, &correlation, &publish, true)),
    );
}

fn reply_to_pending(
    payload: &Value,
    correlation: &Arc<CorrelationStore>,
    publish: &Arc<dyn Fn(String, Vec<u8>) + Send + Sync>,
    delete_after_reply: bool,
) -> Result<(), String> {
    let device_key = payload
        .get("DeviceKey")
        .and_then(Value::as_str)
        .ok_or_else(|| "reply payload missing DeviceKey".to_string())?;

    let pending = correlation
        .get(device_key, None)
        .ok_or_else(|| format!("no pending request for device {device_key}"))?;

    let data = payload.get("ReplyData").cloned().unwrap_or(Value::Null);
    let reply =
        crate::mqtt::envelope::ServiceCallOutputRes::success(pending.message_id.clone(), data);
    let body = serde_json::to_vec(&reply).map_err(|e| e.to_string())?;

    publish(format!("{}_reply", pending.topic), body);

    if delete_after_reply {
        correlation.delete(device_key);
    }
    Ok(())
}
