//! Session registry: `client_id -> Session`, with a background sweeper that
//! evicts idle sessions.
//!
//! Grounded on `original_source/network/server.go` (`BaseServer.devices sync.Map`,
//! `cleanupInactiveDevices`). `dashmap` stands in for Go's `sync.Map` (see
//! DESIGN.md for why it was pulled from the pack rather than the teacher crate,
//! which has no concurrent-map workload of this shape).

use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a session's transport reaches the device.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp,
    Udp { remote: SocketAddr },
    MqttTunnel,
}

/// One active device link.
pub struct Session {
    pub client_id: String,
    pub transport: Transport,
    device_key: Mutex<Option<String>>,
    metadata: Mutex<Value>,
    online: AtomicBool,
    last_active: Mutex<Instant>,
    /// Cancelled by the sweeper (or explicit close) to unblock the read loop.
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(client_id: impl Into<String>, transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            transport,
            device_key: Mutex::new(None),
            metadata: Mutex::new(Value::Null),
            online: AtomicBool::new(true),
            last_active: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn device_key(&self) -> Option<String> {
        self.device_key.lock().unwrap().clone()
    }

    pub fn set_device_key(&self, key: impl Into<String>) {
        *self.device_key.lock().unwrap() = Some(key.into());
    }

    pub fn metadata(&self) -> Value {
        self.metadata.lock().unwrap().clone()
    }

    pub fn set_metadata(&self, value: Value) {
        *self.metadata.lock().unwrap() = value;
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }

    fn mark_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Concurrent `client_id -> Session` map plus an idle-eviction sweeper.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    timeout: Duration,
    cleanup_interval: Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration, cleanup_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            timeout,
            cleanup_interval,
        })
    }

    pub fn store(&self, session: Arc<Session>) {
        self.sessions.insert(session.client_id.clone(), session);
    }

    pub fn load(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|e| e.value().clone())
    }

    pub fn load_or_create(&self, client_id: &str, transport: Transport) -> Arc<Session> {
        self.sessions
            .entry(client_id.to_string())
            .or_insert_with(|| Session::new(client_id, transport))
            .value()
            .clone()
    }

    /// Removes and returns the session, marking it offline and cancelling its
    /// read loop if it hadn't already been.
    pub fn load_and_remove(&self, client_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(client_id)?;
        session.mark_offline();
        Some(session)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Session)) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Runs until `cancel` fires, sweeping idle sessions every `cleanup_interval`.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep_once(),
            }
        }
    }

    fn sweep_once(&self) {
        let idle_bound = self.timeout * 2;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > idle_bound)
            .map(|e| e.key().clone())
            .collect();

        for client_id in expired {
            if self.load_and_remove(&client_id).is_some() {
                debug!(client_id = %client_id, "evicted idle session");
            }
        }
    }
}
