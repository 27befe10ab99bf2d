//! Reconnect backoff supervisor for the upstream MQTT bridge.
//!
//! Grounded on `original_source/mqttClient/reconnect.go`'s `ReconnectManager`:
//! same backoff law (`1s * 2^currentRetry`, capped at 5 minutes), same
//! `maxRetries = 10`, same poll cadence (5s while disconnected, 30s while
//! connected). `rumqttc`'s `EventLoop` already reconnects the transport on its
//! own; this supervisor only tracks and exposes the retry/backoff bookkeeping
//! the platform-facing status surface (and tests) need.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const MAX_RETRIES: u32 = 10;

const POLL_WHILE_DISCONNECTED: Duration = Duration::from_secs(5);
const POLL_WHILE_CONNECTED: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconnectStatus {
    pub current_retry: u32,
    pub max_retries: u32,
    pub last_reconnect_time: Option<i64>,
    pub is_connected: bool,
    pub is_reconnecting: bool,
}

/// Tracks reconnect attempts and the backoff delay to apply before the next one.
pub struct ReconnectSupervisor {
    current_retry: AtomicU32,
    last_reconnect_time: Mutex<Option<i64>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self {
            current_retry: AtomicU32::new(0),
            last_reconnect_time: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        }
    }
}

impl ReconnectSupervisor {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.current_retry.store(0, Ordering::SeqCst);
            *self.last_reconnect_time.lock().unwrap() = Some(chrono::Utc::now().timestamp());
        }
    }

    /// Whether the retry budget is exhausted — callers should stop attempting
    /// further reconnects and surface an error once this is true.
    pub fn retries_exhausted(&self) -> bool {
        self.current_retry.load(Ordering::SeqCst) >= MAX_RETRIES
    }

    /// The backoff to wait before the next reconnect attempt, and records
    /// that an attempt is about to be made by incrementing the retry counter.
    pub fn next_backoff(&self) -> Duration {
        let retry = self.current_retry.fetch_add(1, Ordering::SeqCst);
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..retry {
            backoff = backoff.saturating_mul(2);
            if backoff >= MAX_BACKOFF {
                return MAX_BACKOFF;
            }
        }
        backoff
    }

    /// How long the poll loop should sleep before re-checking connectivity.
    pub fn poll_interval(&self) -> Duration {
        if self.is_connected() {
            POLL_WHILE_CONNECTED
        } else {
            POLL_WHILE_DISCONNECTED
        }
    }

    pub fn begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> ReconnectStatus {
        ReconnectStatus {
            current_retry: self.current_retry.load(Ordering::SeqCst),
            max_retries: MAX_RETRIES,
            last_reconnect_time: *self.last_reconnect_time.lock().unwrap(),
            is_connected: self.is_connected(),
            is_reconnecting: self.reconnecting.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_five_minutes() {
        let supervisor = ReconnectSupervisor::new();
        assert_eq!(supervisor.next_backoff(), Duration::from_secs(1));
        assert_eq!(supervisor.next_backoff(), Duration::from_secs(2));
        assert_eq!(supervisor.next_backoff(), Duration::from_secs(4));
        for _ in 0..10 {
            supervisor.next_backoff();
        }
        assert_eq!(supervisor.next_backoff(), MAX_BACKOFF);
    }

    #[test]
    fn reaching_max_retries_reports_exhausted() {
        let supervisor = ReconnectSupervisor::new();
        assert!(!supervisor.retries_exhausted());
        for _ in 0..MAX_RETRIES {
            supervisor.next_backoff();
        }
        assert!(supervisor.retries_exhausted());
    }

    #[test]
    fn connecting_resets_retry_counter() {
        let supervisor = ReconnectSupervisor::new();
        supervisor.next_backoff();
        supervisor.next_backoff();
        supervisor.set_connected(true);
        assert_eq!(supervisor.status().current_retry, 0);
        assert!(supervisor.status().is_connected);
    }

    #[test]
    fn poll_interval_depends_on_connectivity() {
        let supervisor = ReconnectSupervisor::new();
        assert_eq!(supervisor.poll_interval(), POLL_WHILE_DISCONNECTED);
        supervisor.set_connected(true);
        assert_eq!(supervisor.poll_interval(), POLL_WHILE_CONNECTED);
    }

    #[test]
    fn only_one_reconnect_runs_at_a_time() {
        let supervisor = ReconnectSupervisor::new();
        assert!(supervisor.begin_reconnect());
        assert!(!supervisor.begin_reconnect());
        supervisor.end_reconnect();
        assert!(supervisor.begin_reconnect());
    }
}
