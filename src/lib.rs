//! IoT device gateway: bridges framed TCP/UDP/MQTT-tunneled device links to a
//! thing-model MQTT broker.
//!
//! The only thing an embedder supplies is a [`protocol::ProtocolHandler`] for
//! their concrete device byte protocol; everything else (framing, session and
//! device bookkeeping, MQTT envelope/reconnect/dispatch, heartbeat, graceful
//! shutdown) is provided by [`gateway::Gateway`].

pub mod config;
pub mod correlation;
pub mod device;
pub mod error;
pub mod events;
pub mod framing;
pub mod gateway;
pub mod heartbeat;
pub mod mqtt;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod southbound;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use protocol::ProtocolHandler;
