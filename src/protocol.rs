//! The embedder's sole extension point: the device byte protocol.
//!
//! Grounded on `original_source/network/protocol.go` (`ProtocolHandler`
//! interface: `Init`/`Encode`/`Decode`). Made `async_trait` because callers
//! already run inside tokio tasks and a real handler may need to do async I/O
//! (e.g. consult another service) while deciding how to answer a device frame.

use crate::error::GatewayError;
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// Implemented by the embedder to decode/encode the concrete device protocol.
///
/// The southbound server calls `init` then `decode` for every frame, in that
/// order, on the session's read loop — never concurrently for the same
/// session. Implementations are responsible for `init`'s idempotence, since it
/// runs before every frame, not just the first.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Inspects a frame (commonly an early handshake) and may populate
    /// `session.set_device_key(...)` / `session.set_metadata(...)`.
    async fn init(&self, session: &Arc<Session>, frame: &[u8]) -> Result<(), GatewayError>;

    /// Renders an outbound device command.
    async fn encode(
        &self,
        session: Option<&Arc<Session>>,
        value: &serde_json::Value,
    ) -> Result<Vec<u8>, GatewayError>;

    /// Decodes a frame. May emit bus events as a side effect (e.g.
    /// `push_attribute_data_to_mqtt`). Returning `Some(bytes)` causes the
    /// southbound server to write `bytes` back on the connection as an
    /// on-wire ACK.
    async fn decode(
        &self,
        session: &Arc<Session>,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, GatewayError>;
}

/// A minimal default handler for running the gateway standalone without a
/// concrete device protocol compiled in: every frame's raw bytes are reported
/// as a single `raw` property, keyed by the session's `client_id` (there is no
/// handshake to learn a logical `deviceKey` from). Real deployments embed this
/// crate as a library and supply their own `ProtocolHandler` instead.
pub struct RawBytesHandler {
    pub bus: Arc<crate::events::EventBus>,
}

#[async_trait]
impl ProtocolHandler for RawBytesHandler {
    async fn init(&self, session: &Arc<Session>, _frame: &[u8]) -> Result<(), GatewayError> {
        if session.device_key().is_none() {
            session.set_device_key(session.client_id.clone());
        }
        Ok(())
    }

    async fn encode(
        &self,
        _session: Option<&Arc<Session>>,
        value: &serde_json::Value,
    ) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(value).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    async fn decode(
        &self,
        session: &Arc<Session>,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        let device_key = session.device_key().unwrap_or_default();
        self.bus
            .must_fire(
                "PushAttributeDataToMQTT",
                serde_json::json!({
                    "DeviceKey": device_key,
                    "PropertieDataList": { "raw": frame },
                }),
            )
            .map_err(GatewayError::Protocol)?;
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A minimal `ProtocolHandler` used by this repo's own integration tests.
    //! Grounded on spec.md §8 scenario 1: a line-delimited handshake that sets
    //! `device_key` on first contact and pushes a single temperature property.

    use super::*;
    use crate::events::EventBus;
    use serde_json::json;

    pub struct EchoHandler {
        pub bus: Arc<EventBus>,
    }

    #[async_trait]
    impl ProtocolHandler for EchoHandler {
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
            value: &serde_json::Value,
        ) -> Result<Vec<u8>, GatewayError> {
            Ok(serde_json::to_vec(value).map_err(|e| GatewayError::Protocol(e.to_string()))?)
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
                    json!({
                        "DeviceKey": device_key,
                        "PropertieDataList": { "temp": 25 },
                    }),
                )
                .map_err(GatewayError::Protocol)?;
            Ok(Some(b"ACK\r\n".to_vec()))
        }
    }
}
