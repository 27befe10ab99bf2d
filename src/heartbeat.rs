//! Periodic gateway-health heartbeat, published on the same property-batch
//! topic as device telemetry.
//!
//! Grounded on `original_source/mqttClient/heartbeat.go`. REDESIGN FLAG
//! (spec.md §8): the original's `time.NewTicker` waits one full interval
//! before firing; this implementation fires immediately on start and then
//! every `duration`, since a freshly-started gateway reporting nothing for up
//! to a full interval is the behavior spec.md calls out to fix.

use crate::device::DeviceRegistry;
use crate::mqtt::bridge::{property_topic, MqttBridge};
use crate::mqtt::envelope::GatewayBatchReqBuilder;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Falls back to this when `CARGO_PKG_VERSION` can't be parsed as `major.minor`,
/// mirroring the original's `versionInfo == "0.0"` fallback.
const FALLBACK_VERSION: &str = "v0.0.1";

fn gateway_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    if version.is_empty() || version == "0.0" {
        FALLBACK_VERSION.to_string()
    } else {
        format!("v{version}")
    }
}

/// Publishes a heartbeat batch: device status, device count, gateway version.
pub async fn publish_once(
    bridge: &Mutex<MqttBridge>,
    product_key: &str,
    device_key: &str,
    devices: &DeviceRegistry,
) {
    let batch = GatewayBatchReqBuilder::new()
        .id(Uuid::new_v4().to_string())
        .version("1.0")
        .add_property("Status", json!(0))
        .add_property("Count", json!(devices.count()))
        .add_property("Version", json!(gateway_version()))
        .build();

    let payload = match serde_json::to_vec(&batch) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to serialize heartbeat batch");
            return;
        }
    };

    let topic = property_topic(product_key, device_key);
    debug!(topic = %topic, "publishing gateway heartbeat");
    if let Err(e) = bridge.lock().await.publish(&topic, payload).await {
        error!(error = %e, "failed to publish heartbeat");
    }
}

/// Runs the heartbeat loop until `cancel` fires. `interval` is the caller's
/// already-coerced `ServerConfig::heartbeat_duration()`.
pub async fn run(
    bridge: Arc<Mutex<MqttBridge>>,
    product_key: String,
    device_key: String,
    devices: Arc<DeviceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                publish_once(&bridge, &product_key, &device_key, &devices).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_version_is_prefixed_with_v() {
        let version = gateway_version();
        assert!(version.starts_with('v'));
    }
}
