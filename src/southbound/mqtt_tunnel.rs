//! Southbound MQTT tunnel mode: instead of opening a TCP/UDP listener, device
//! frames arrive as payloads on `ser_up_topic` and outbound writes publish on
//! `ser_down_topic`.
//!
//! Grounded on spec.md §6 ("Southbound MQTT mode"). The original passes a nil
//! `*Device` into `Decode` for this path since there is no live socket
//! session; here `ProtocolHandler::decode` takes `&Arc<Session>` by
//! reference, so a single long-lived synthetic session stands in for "no
//! session" and is reused across every message on the tunnel.

use crate::mqtt::bridge::MqttBridge;
use crate::protocol::ProtocolHandler;
use crate::session::{Session, Transport};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs the tunnel loop until `cancel` fires: subscribes to `ser_up_topic`,
/// decodes every payload through `handler`, and publishes non-empty replies
/// on `ser_down_topic`.
pub async fn run(
    bridge: Arc<Mutex<MqttBridge>>,
    ser_up_topic: String,
    ser_down_topic: String,
    handler: Arc<dyn ProtocolHandler>,
    cancel: CancellationToken,
) -> Result<(), crate::error::GatewayError> {
    bridge.lock().await.subscribe(&ser_up_topic).await?;

    let session = Session::new("mqtt_tunnel", Transport::MqttTunnel);

    loop {
        let message = {
            let mut bridge = bridge.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = bridge.recv() => message,
            }
        };

        let Some(message) = message else {
            return Ok(());
        };
        if message.topic != ser_up_topic {
            continue;
        }

        if let Err(e) = handler.init(&session, &message.payload).await {
            warn!(error = %e, "protocol init failed on mqtt tunnel");
            continue;
        }

        match handler.decode(&session, &message.payload).await {
            Ok(Some(reply)) => {
                if let Err(e) = bridge.lock().await.publish(&ser_down_topic, reply).await {
                    warn!(error = %e, "failed to publish mqtt tunnel reply");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "protocol decode failed on mqtt tunnel"),
        }
        debug!(topic = %ser_up_topic, "mqtt tunnel frame handled");
    }
}
