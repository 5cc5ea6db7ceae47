//! In-tab publish/subscribe.
//!
//! Handlers run synchronously on the emitting task. Each invocation is
//! isolated: a panicking handler is logged and skipped and the remaining
//! subscribers still receive the event.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, error};

/// Where a change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Written by a feature module in this tab.
    Local,
    /// Written by another tab of the same profile.
    CrossTab,
    /// Applied from a remote pull.
    Remote,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Base key (data type name or fixed key) the event is about.
    pub topic: String,
    /// New value, `None` when the key was removed.
    pub payload: Option<Value>,
    pub source: ChangeSource,
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    topics: RwLock<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

/// Topic-keyed event bus. Clones share subscribers.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Arc<Registry>,
}

/// Handle returned by [`LocalEventBus::subscribe`].
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    topic: String,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut topics = registry
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = topics.get_mut(&self.topic) {
            handlers.retain(|(id, _)| *id != self.id);
            if handlers.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events on `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        debug!("Subscribed handler {} to '{}'", id, topic);
        Subscription {
            id,
            topic,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every subscriber of `topic`.
    ///
    /// # Returns
    /// Number of handlers that completed without panicking.
    pub fn emit(&self, topic: &str, payload: Option<Value>, source: ChangeSource) -> usize {
        // Snapshot so handlers may (un)subscribe while being invoked.
        let handlers: Vec<(u64, Handler)> = {
            let topics = self
                .inner
                .topics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic) {
                Some(handlers) => handlers.clone(),
                None => return 0,
            }
        };

        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            source,
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Handler {} for '{}' panicked: {}", id, topic, reason);
                }
            }
        }
        delivered
    }

    /// Number of handlers registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_subscribers() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let _sub = bus.subscribe("settings", move |event| {
            assert_eq!(event.source, ChangeSource::Local);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.emit("settings", Some(serde_json::json!({})), ChangeSource::Local);
        assert_eq!(delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert_eq!(bus.emit("staff", None, ChangeSource::Local), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let first = seen.clone();
        let _a = bus.subscribe("themes", move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let _b = bus.subscribe("themes", |_| panic!("consumer bug"));
        let last = seen.clone();
        let _c = bus.subscribe("themes", move |_| {
            last.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.emit("themes", None, ChangeSource::CrossTab);
        assert_eq!(delivered, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = LocalEventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let sub = bus.subscribe("staff", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count("staff"), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("staff"), 0);
        bus.emit("staff", None, ChangeSource::Local);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let bus = LocalEventBus::new();
        let inner_bus = bus.clone();

        let _sub = bus.subscribe("settings", move |_| {
            let _nested = inner_bus.subscribe("settings", |_| {});
        });

        bus.emit("settings", None, ChangeSource::Local);
        assert_eq!(bus.subscriber_count("settings"), 2);
    }
}
