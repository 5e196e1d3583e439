//! In-process pub/sub bus decoupling the supervisor, registry, endpoint
//! manager, and any external admin surface.
//!
//! Emission is synchronous and best-effort: `emit` walks the subscriber
//! list for the event name and calls each one in registration order. A
//! subscriber that panics is isolated with `catch_unwind` so it cannot
//! abort the emit loop or starve other subscribers; the panic is logged
//! and the bus moves on.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

/// A structured event payload. Event names are plain strings (see the
/// vocabulary in the component design); payloads are arbitrary JSON so
/// producers and consumers can evolve independently.
pub type EventPayload = serde_json::Value;

type Subscriber = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Well-known event names emitted by the core's subsystems.
pub mod names {
    pub const SERVICE_CONNECTED: &str = "mcp:service:connected";
    pub const SERVICE_DISCONNECTED: &str = "mcp:service:disconnected";
    pub const SERVICE_CONNECTION_FAILED: &str = "mcp:service:connection:failed";
    pub const SERVER_ADDED: &str = "mcp:server:added";
    pub const SERVER_BATCH_ADDED: &str = "mcp:server:batch_added";
    pub const SERVER_REMOVED: &str = "mcp:server:removed";
    pub const SERVER_STATUS_CHANGED: &str = "mcp:server:status_changed";
    pub const RESTART_REQUESTED: &str = "service:restart:requested";
    pub const RESTART_STARTED: &str = "service:restart:started";
    pub const RESTART_COMPLETED: &str = "service:restart:completed";
    pub const HEALTH_CHANGED: &str = "service:health:changed";
    pub const ENDPOINT_STATUS_CHANGED: &str = "endpoint:status:changed";
    pub const CONFIG_UPDATED: &str = "config:updated";
    pub const TOOL_SYNC_SERVICE_TOOLS_REMOVED: &str = "tool-sync:service-tools-removed";
}

/// A handle returned by [`EventBus::subscribe`]; dropping it does not
/// unsubscribe (subscriptions are intentionally permanent for the core's
/// lifetime, mirroring how the supervisor/registry/endpoint manager wire
/// each other up once at startup).
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    subscribers: HashMap<String, Vec<(u64, Subscriber)>>,
    next_id: u64,
}

/// Synchronous, best-effort pub/sub bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a named event. The callback runs synchronously on the
    /// emitting thread/task; it must not block.
    pub fn subscribe<F>(&self, event_name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subscribers
            .entry(event_name.into())
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, event_name: &str, id: &SubscriptionId) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        if let Some(list) = inner.subscribers.get_mut(event_name) {
            list.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    /// Emit an event by name. Subscribers for this name only are invoked,
    /// in the order they were registered, each isolated from the others.
    pub fn emit(&self, event_name: &str, payload: EventPayload) {
        let subscribers = {
            let inner = self.inner.lock().expect("event bus mutex poisoned");
            inner.subscribers.get(event_name).cloned().unwrap_or_default()
        };

        for (_, subscriber) in subscribers {
            let payload_ref = &payload;
            let result = catch_unwind(AssertUnwindSafe(|| subscriber(payload_ref)));
            if result.is_err() {
                tracing::warn!(event = event_name, "event subscriber panicked; isolated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_emits_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe("mcp:service:connected", move |payload| {
            seen_clone.lock().unwrap().push(payload.clone());
        });

        bus.emit("mcp:service:connected", serde_json::json!({ "n": 1 }));
        bus.emit("mcp:service:connected", serde_json::json!({ "n": 2 }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["n"], 1);
        assert_eq!(seen[1]["n"], 2);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe("x", |_| panic!("boom"));

        let count_clone = Arc::clone(&count);
        bus.subscribe("x", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("x", serde_json::json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unrelated_event_names_do_not_cross_fire() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe("a", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("b", serde_json::json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
