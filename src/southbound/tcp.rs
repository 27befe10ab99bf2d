//! TCP southbound server: one task per accepted connection, each framing and
//! dispatching through the configured `ProtocolHandler`.
//!
//! Grounded on `original_source/network/tcp.go` (`TcpServer::Start`/
//! `handleDataReceived`) and `network/server.go` (`handleConnect`/
//! `handleDisconnect`/`handleReceiveData`), adapted from its event-dispatcher
//! style to direct async calls since `ProtocolHandler` here is already async.

use crate::device::DeviceRegistry;
use crate::events::EventBus;
use crate::framing::Framer;
use crate::protocol::ProtocolHandler;
use crate::session::{Session, SessionRegistry, Transport};
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs the TCP accept loop until `cancel` fires.
pub async fn run(
    addr: &str,
    framer: Arc<Framer>,
    handler: Arc<dyn ProtocolHandler>,
    sessions: Arc<SessionRegistry>,
    devices: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    read_timeout: std::time::Duration,
    cancel: CancellationToken,
) -> Result<(), crate::error::GatewayError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "tcp southbound server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tcp southbound server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept tcp connection");
                        continue;
                    }
                };

                let client_id = peer.to_string();
                let session = Session::new(client_id.clone(), Transport::Tcp);
                sessions.store(session.clone());

                let framer = framer.clone();
                let handler = handler.clone();
                let sessions = sessions.clone();
                let devices = devices.clone();
                let bus = bus.clone();

                tokio::spawn(async move {
                    handle_connection(stream, session, framer, handler, devices, bus, read_timeout).await;
                    sessions.load_and_remove(&client_id);
                });
            }
        }
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    session: Arc<Session>,
    framer: Arc<Framer>,
    handler: Arc<dyn ProtocolHandler>,
    devices: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    read_timeout: std::time::Duration,
) {
    debug!(client_id = session.client_id, "device connected");

    loop {
        let frame = tokio::select! {
            _ = session.cancel.cancelled() => break,
            result = tokio::time::timeout(read_timeout, framer.read_frame(&mut stream)) => result,
        };

        let frame = match frame {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(client_id = session.client_id, error = %e, "framing error, closing connection");
                break;
            }
            Err(_) => {
                debug!(client_id = session.client_id, "read timeout, closing connection");
                break;
            }
        };

        if let Err(e) = handler.init(&session, &frame).await {
            warn!(client_id = session.client_id, error = %e, "protocol init failed");
            break;
        }

        session.touch();
        if let Some(device_key) = session.device_key() {
            let is_new = devices.get(&device_key).is_none();
            devices.upsert(&device_key, &session.client_id);
            if is_new {
                bus.fire_async("device_attached", json!({"DeviceKey": device_key}));
            }
        }

        match handler.decode(&session, &frame).await {
            Ok(Some(reply)) => {
                if let Err(e) = stream.write_all(&reply).await {
                    warn!(client_id = session.client_id, error = %e, "failed to write reply");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client_id = session.client_id, error = %e, "protocol decode failed");
                bus.fire_async(
                    "device_decode_error",
                    json!({"ClientId": session.client_id}),
                );
            }
        }
    }

    if let Some(device_key) = session.device_key() {
        devices.mark_offline(&device_key);
    }
    bus.fire_async(
        "device_disconnected",
        json!({"ClientId": session.client_id, "DeviceKey": session.device_key()}),
    );
    debug!(client_id = session.client_id, "device disconnected");
}
