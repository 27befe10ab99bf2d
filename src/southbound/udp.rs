//! UDP southbound server: one socket, one receive loop, each datagram taken
//! as a complete frame (UDP does not need the byte-stream framer).
//!
//! Grounded on `original_source/network/udp.go` (`UDPServer::Start`):
//! `LoadOrStore` by remote address for the per-client `Device`, per-packet
//! read deadline, reply written back to the originating `SocketAddr`.

use crate::device::DeviceRegistry;
use crate::events::EventBus;
use crate::protocol::ProtocolHandler;
use crate::session::{Session, SessionRegistry, Transport};
use serde_json::json;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM_SIZE: usize = 2048;

/// Runs the UDP receive loop until `cancel` fires.
pub async fn run(
    addr: &str,
    handler: Arc<dyn ProtocolHandler>,
    sessions: Arc<SessionRegistry>,
    devices: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    read_timeout: std::time::Duration,
    cancel: CancellationToken,
) -> Result<(), crate::error::GatewayError> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    info!(addr, "udp southbound server listening");

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                info!("udp southbound server shutting down");
                return Ok(());
            }
            result = tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)) => result,
        };

        let (n, remote) = match received {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "udp recv error");
                continue;
            }
            Err(_) => continue,
        };

        let client_id = remote.to_string();
        let session = sessions.load_or_create(&client_id, Transport::Udp { remote });
        session.touch();

        let frame = buf[..n].to_vec();

        if let Err(e) = handler.init(&session, &frame).await {
            warn!(client_id, error = %e, "protocol init failed");
            continue;
        }

        if let Some(device_key) = session.device_key() {
            let is_new = devices.get(&device_key).is_none();
            devices.upsert(&device_key, &client_id);
            if is_new {
                bus.fire_async("device_attached", json!({"DeviceKey": device_key}));
            }
        }

        match handler.decode(&session, &frame).await {
            Ok(Some(reply)) => {
                if let Err(e) = socket.send_to(&reply, remote).await {
                    warn!(client_id, error = %e, "failed to send udp reply");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client_id, error = %e, "protocol decode failed");
                bus.fire_async("device_decode_error", json!({"ClientId": client_id}));
            }
        }
        debug!(client_id, "udp datagram handled");
    }
}
