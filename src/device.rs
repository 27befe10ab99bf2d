//! Logical device identity, separate from the transport-level `Session`.
//!
//! Grounded on `original_source/vars/deviceListAllMap.go` (`deviceListAllMap
//! sync.Map`, `UpdateDeviceMap`, `GetDevice`, `CountDevices`) and
//! `original_source/model/device.go`.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A device's logical record. Survives brief disconnects — it lives in its own
/// map and is only "offline" once its `Session` is gone from the registry.
pub struct DeviceRecord {
    pub device_key: String,
    last_client_id: Mutex<String>,
    online: AtomicBool,
    info: Mutex<Value>,
    alarm_info: Mutex<Value>,
    last_active: Mutex<Instant>,
}

impl DeviceRecord {
    fn new(device_key: impl Into<String>, client_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            device_key: device_key.into(),
            last_client_id: Mutex::new(client_id.into()),
            online: AtomicBool::new(true),
            info: Mutex::new(Value::Null),
            alarm_info: Mutex::new(Value::Null),
            last_active: Mutex::new(Instant::now()),
        })
    }

    pub fn last_client_id(&self) -> String {
        self.last_client_id.lock().unwrap().clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn info(&self) -> Value {
        self.info.lock().unwrap().clone()
    }

    pub fn set_info(&self, value: Value) {
        *self.info.lock().unwrap() = value;
    }

    pub fn alarm_info(&self) -> Value {
        self.alarm_info.lock().unwrap().clone()
    }

    pub fn set_alarm_info(&self, value: Value) {
        *self.alarm_info.lock().unwrap() = value;
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }
}

/// Concurrent `device_key -> DeviceRecord` map.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the record on first sight of a device, or refreshes its
    /// `last_client_id`/liveness/online status on subsequent sightings.
    pub fn upsert(&self, device_key: &str, client_id: &str) -> Arc<DeviceRecord> {
        let record = self
            .devices
            .entry(device_key.to_string())
            .or_insert_with(|| DeviceRecord::new(device_key, client_id))
            .value()
            .clone();
        *record.last_client_id.lock().unwrap() = client_id.to_string();
        record.set_online(true);
        record.touch();
        record
    }

    pub fn get(&self, device_key: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.get(device_key).map(|e| e.value().clone())
    }

    pub fn mark_offline(&self, device_key: &str) {
        if let Some(record) = self.get(device_key) {
            record.set_online(false);
        }
    }

    /// Number of registered devices — used by the heartbeat's `Count` property.
    pub fn count(&self) -> usize {
        self.devices.len()
    }
}
