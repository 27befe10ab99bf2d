//! Request/response correlation store: ties a platform request identified by
//! `(deviceKey, messageId)` to the device's eventual reply, with a fixed 30s TTL.
//!
//! Grounded on `original_source/vars/deviceMessageMap.go`
//! (`UpdateUpMessageMap`/`GetUpMessageMap`/`DeleteFromUpMessageMap`) for the
//! primary index, and spec.md §4.8 for the secondary `deviceKey_messageId` index
//! and TTL semantics the plain `sync.Map` in the Go source doesn't itself encode.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// TTL for a stored `PendingRequest`. Fixed per spec — not configurable, and
/// never extended on device activity (Open Question decision, see DESIGN.md).
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(30);

/// Sweep interval for expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A platform-originated call awaiting a device reply.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub message_id: String,
    pub send_time: i64,
    pub method_name: String,
    pub topic: String,
    expires_at: Instant,
}

impl PendingRequest {
    pub fn new(message_id: String, method_name: String, topic: String, send_time: i64) -> Self {
        Self {
            message_id,
            send_time,
            method_name,
            topic,
            expires_at: Instant::now() + PENDING_REQUEST_TTL,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

fn secondary_key(device_key: &str, message_id: &str) -> String {
    format!("{device_key}_{message_id}")
}

/// Dual-indexed TTL cache: `device_key -> PendingRequest` (legacy, last-writer-
/// wins) and `device_key_messageId -> PendingRequest` (precise, supports
/// concurrent in-flight calls to the same device).
#[derive(Default)]
pub struct CorrelationStore {
    primary: DashMap<String, PendingRequest>,
    secondary: DashMap<String, PendingRequest>,
}

impl CorrelationStore {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Stores under both indices.
    pub fn store(&self, device_key: &str, request: PendingRequest) {
        self.secondary
            .insert(secondary_key(device_key, &request.message_id), request.clone());
        self.primary.insert(device_key.to_string(), request);
    }

    /// Reads preferring the secondary index when `message_id` is known,
    /// otherwise the primary. Expired entries are removed lazily and reported
    /// as a miss.
    pub fn get(&self, device_key: &str, message_id: Option<&str>) -> Option<PendingRequest> {
        if let Some(message_id) = message_id {
            let key = secondary_key(device_key, message_id);
            if let Some(entry) = self.secondary.get(&key) {
                if entry.is_expired() {
                    drop(entry);
                    self.secondary.remove(&key);
                    return None;
                }
                return Some(entry.clone());
            }
            return None;
        }

        if let Some(entry) = self.primary.get(device_key) {
            if entry.is_expired() {
                drop(entry);
                self.primary.remove(device_key);
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    /// Deletes the primary entry for `device_key` and its associated
    /// secondary entry.
    pub fn delete(&self, device_key: &str) {
        if let Some((_, request)) = self.primary.remove(device_key) {
            self.secondary
                .remove(&secondary_key(device_key, &request.message_id));
        }
    }

    /// Removes every secondary entry prefixed `device_key_`.
    pub fn purge_device(&self, device_key: &str) {
        let prefix = format!("{device_key}_");
        let stale: Vec<String> = self
            .secondary
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.secondary.remove(&key);
        }
        self.primary.remove(device_key);
    }

    fn sweep_once(&self) {
        let expired_primary: Vec<String> = self
            .primary
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for key in expired_primary {
            self.primary.remove(&key);
        }

        let expired_secondary: Vec<String> = self
            .secondary
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for key in expired_secondary {
            self.secondary.remove(&key);
        }
    }

    /// Runs until `cancel` fires, sweeping expired entries every 5 minutes.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep_once(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn readable_before_ttl_not_after() {
        let store = CorrelationStore::new();
        store.store(
            "D1",
            PendingRequest::new("m-1".into(), "reboot".into(), "/t".into(), 0),
        );

        assert!(store.get("D1", None).is_some());
        assert!(store.get("D1", Some("m-1")).is_some());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.get("D1", None).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("D1", None).is_none());
        assert!(store.get("D1", Some("m-1")).is_none());
    }

    #[test]
    fn secondary_index_supports_concurrent_in_flight_calls() {
        let store = CorrelationStore::new();
        store.store(
            "D1",
            PendingRequest::new("m-1".into(), "reboot".into(), "/t1".into(), 0),
        );
        store.store(
            "D1",
            PendingRequest::new("m-2".into(), "ping".into(), "/t2".into(), 0),
        );

        // Primary is last-writer-wins.
        assert_eq!(store.get("D1", None).unwrap().message_id, "m-2");
        // Secondary still has both.
        assert_eq!(store.get("D1", Some("m-1")).unwrap().topic, "/t1");
        assert_eq!(store.get("D1", Some("m-2")).unwrap().topic, "/t2");
    }

    #[test]
    fn delete_removes_primary_and_its_secondary_entry() {
        let store = CorrelationStore::new();
        store.store(
            "D1",
            PendingRequest::new("m-1".into(), "reboot".into(), "/t".into(), 0),
        );
        store.delete("D1");

        assert!(store.get("D1", None).is_none());
        assert!(store.get("D1", Some("m-1")).is_none());
    }

    #[test]
    fn purge_device_removes_all_secondary_entries_for_device() {
        let store = CorrelationStore::new();
        store.store(
            "D1",
            PendingRequest::new("m-1".into(), "reboot".into(), "/t1".into(), 0),
        );
        store.store(
            "D1",
            PendingRequest::new("m-2".into(), "ping".into(), "/t2".into(), 0),
        );
        store.purge_device("D1");

        assert!(store.get("D1", Some("m-1")).is_none());
        assert!(store.get("D1", Some("m-2")).is_none());
        assert!(store.get("D1", None).is_none());
    }
}
