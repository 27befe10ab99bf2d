//! Error types shared across the gateway's subsystems.

use thiserror::Error;

/// Errors surfaced by gateway subsystems.
///
/// Code that bubbles all the way up to `main` works in terms of `anyhow::Result`
/// (see `main.rs`, `gateway.rs`); internal APIs that callers pattern-match on
/// return `Result<T, GatewayError>`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol handler error: {0}")]
    Protocol(String),
}
