//! In-process event bus decoupling protocol decoders from MQTT publishers.
//!
//! Grounded on `original_source/events/pushEvents.go` and
//! `original_source/events/const.go`, which register listeners against the
//! `gookit/event` library with `event.Normal`/`event.High` priorities and fire
//! them with `event.MustFire`. There is no direct Rust equivalent in the pack,
//! so the registry itself is implemented natively; the priority-ordered,
//! panic-isolated dispatch semantics come from spec.md §4.6.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

/// Listener priority. Listeners for the same event fire in `High` before
/// `Normal` order; ties preserve registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

/// A listener callback. Returns `Err` to signal a handling failure; panics are
/// caught at the bus boundary and treated as an error too.
pub type Listener = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct Registration {
    priority: Priority,
    /// Monotonic registration order, used as the tie-break within a priority.
    seq: usize,
    listener: Listener,
}

/// Priority-ordered, synchronous/async in-process pub/sub keyed by event name.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
    next_seq: std::sync::atomic::AtomicUsize,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a listener for `event_name` at `priority`.
    pub fn on(&self, event_name: impl Into<String>, priority: Priority, listener: Listener) {
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut listeners = self.listeners.write().unwrap();
        let entries = listeners.entry(event_name.into()).or_default();
        entries.push(Registration {
            priority,
            seq,
            listener,
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    fn ordered_listeners(&self, event_name: &str) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap()
            .get(event_name)
            .map(|entries| entries.iter().map(|r| r.listener.clone()).collect())
            .unwrap_or_default()
    }

    /// Fires listeners synchronously on the caller's task, in priority order.
    /// The first listener error is propagated; a panicking listener is caught,
    /// logged, and counted as an error without aborting the process or
    /// skipping the remaining listeners.
    pub fn must_fire(&self, event_name: &str, payload: Value) -> Result<(), String> {
        let mut first_err = None;
        for listener in self.ordered_listeners(event_name) {
            let payload_ref = &payload;
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(payload_ref)));
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(&panic);
                    error!(event = event_name, panic = %message, "listener panicked");
                    Err(format!("listener panicked: {message}"))
                }
            };
            if let Err(e) = result {
                warn!(event = event_name, error = %e, "listener returned error");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Schedules the same dispatch on a background task. Listener errors
    /// (including panics) are logged only — callers that must not block use
    /// this instead of `must_fire`.
    pub fn fire_async(self: &Arc<Self>, event_name: impl Into<String>, payload: Value) {
        let bus = self.clone();
        let event_name = event_name.into();
        tokio::spawn(async move {
            if let Err(e) = bus.must_fire(&event_name, payload) {
                error!(event = %event_name, error = %e, "async event dispatch failed");
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn listeners_fire_high_priority_before_normal() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_normal = order.clone();
        bus.on(
            "x",
            Priority::Normal,
            Arc::new(move |_| {
                order_normal.lock().unwrap().push("normal");
                Ok(())
            }),
        );
        let order_high = order.clone();
        bus.on(
            "x",
            Priority::High,
            Arc::new(move |_| {
                order_high.lock().unwrap().push("high");
                Ok(())
            }),
        );

        bus.must_fire("x", json!(null)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "normal"]);
    }

    #[test]
    fn must_fire_propagates_first_error_but_runs_remaining_listeners() {
        let bus = EventBus::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let ran1 = ran.clone();
        bus.on(
            "x",
            Priority::High,
            Arc::new(move |_| {
                ran1.lock().unwrap().push(1);
                Err("boom".to_string())
            }),
        );
        let ran2 = ran.clone();
        bus.on(
            "x",
            Priority::Normal,
            Arc::new(move |_| {
                ran2.lock().unwrap().push(2);
                Ok(())
            }),
        );

        let result = bus.must_fire("x", json!(null));
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(*ran.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_remaining_listeners() {
        let bus = EventBus::new();
        let ran = Arc::new(Mutex::new(false));

        bus.on(
            "x",
            Priority::High,
            Arc::new(|_| panic!("listener bug")),
        );
        let ran2 = ran.clone();
        bus.on(
            "x",
            Priority::Normal,
            Arc::new(move |_| {
                *ran2.lock().unwrap() = true;
                Ok(())
            }),
        );

        let result = bus.must_fire("x", json!(null));
        assert!(result.is_err());
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn fire_async_runs_on_a_background_task() {
        let bus = EventBus::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        bus.on(
            "x",
            Priority::Normal,
            Arc::new(move |_| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }),
        );

        bus.fire_async("x", json!(null));
        rx.await.unwrap();
    }
}
