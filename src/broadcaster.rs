//! Listener registries for the position stream and the error stream.
//!
//! Delivery is synchronous, in registration order, outside the registry lock
//! (listeners may subscribe or unsubscribe from inside a callback). A panicking
//! listener is caught and logged; the remaining listeners still receive the
//! item. The position registry replays the latest item to new subscribers
//! before `subscribe` returns. The error registry never replays.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::LocationError;
use crate::types::PositionRecord;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Callback<T>)>,
    latest: Option<T>,
}

/// Ordered set of callbacks with optional replay-on-subscribe
pub struct ObserverRegistry<T> {
    name: &'static str,
    replay: bool,
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: Clone + Send + 'static> ObserverRegistry<T> {
    /// New subscribers immediately receive the latest published item.
    pub fn with_replay(name: &'static str) -> Self {
        Self::build(name, true)
    }

    pub fn without_replay(name: &'static str) -> Self {
        Self::build(name, false)
    }

    fn build(name: &'static str, replay: bool) -> Self {
        ObserverRegistry {
            name,
            replay,
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
                latest: None,
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let (id, replay_item) = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, callback.clone()));
            let replay_item = if self.replay {
                registry.latest.clone()
            } else {
                None
            };
            (id, replay_item)
        };

        if let Some(item) = replay_item {
            self.invoke(id, &callback, &item);
        }

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut registry = inner.lock().unwrap_or_else(|e| e.into_inner());
                    registry.listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver to every listener. Returns how many listeners returned normally.
    pub fn publish(&self, item: &T) -> usize {
        self.publish_while(item, || true)
    }

    /// Deliver to listeners in order while `keep_going` holds, checked before
    /// each callback. The item becomes the replay value only if delivery
    /// starts at all.
    pub fn publish_while(&self, item: &T, keep_going: impl Fn() -> bool) -> usize {
        let listeners = {
            let mut registry = self.lock();
            if !keep_going() {
                return 0;
            }
            if self.replay {
                registry.latest = Some(item.clone());
            }
            registry.listeners.clone()
        };

        let mut delivered = 0;
        for (id, callback) in &listeners {
            if !keep_going() {
                break;
            }
            if self.invoke(*id, callback, item) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    /// Forget the replay value; later subscribers get nothing until the next publish.
    pub fn clear_latest(&self) {
        self.lock().latest = None;
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn invoke(&self, id: u64, callback: &Callback<T>, item: &T) -> bool {
        match catch_unwind(AssertUnwindSafe(|| callback(item))) {
            Ok(()) => true,
            Err(payload) => {
                log::error!(
                    "{} listener #{} panicked: {}",
                    self.name,
                    id,
                    panic_message(&payload)
                );
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by `subscribe`. Dropping it leaves the listener
/// registered; call `unsubscribe` to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Position and error channels of one tracker
pub struct PositionBroadcaster {
    positions: ObserverRegistry<PositionRecord>,
    errors: ObserverRegistry<LocationError>,
}

impl Default for PositionBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionBroadcaster {
    pub fn new() -> Self {
        Self {
            positions: ObserverRegistry::with_replay("position"),
            errors: ObserverRegistry::without_replay("error"),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PositionRecord) + Send + Sync + 'static,
    {
        self.positions.subscribe(callback)
    }

    pub fn subscribe_to_errors<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LocationError) + Send + Sync + 'static,
    {
        self.errors.subscribe(callback)
    }

    /// Drop the replayed position at a session boundary
    pub fn clear_replay(&self) {
        self.positions.clear_latest();
    }

    pub fn publish_position(&self, record: &PositionRecord, keep_going: impl Fn() -> bool) -> usize {
        self.positions.publish_while(record, keep_going)
    }

    pub fn publish_error(&self, error: &LocationError, keep_going: impl Fn() -> bool) -> usize {
        self.errors.publish_while(error, keep_going)
    }

    pub fn position_listener_count(&self) -> usize {
        self.positions.listener_count()
    }

    pub fn error_listener_count(&self) -> usize {
        self.errors.listener_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |item: &T| sink.lock().unwrap().push(item.clone()))
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let registry = ObserverRegistry::<u32>::without_replay("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            let _ = registry.subscribe(move |value: &u32| {
                order.lock().unwrap().push(format!("{}{}", tag, value))
            });
        }
        assert_eq!(registry.publish(&7), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn test_replay_is_synchronous() {
        let registry = ObserverRegistry::<u32>::with_replay("test");
        registry.publish(&1);
        registry.publish(&2);

        let (seen, sink) = collector();
        let _sub = registry.subscribe(sink);
        // Already delivered before subscribe returned
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_no_replay_without_history_or_for_errors() {
        let registry = ObserverRegistry::<u32>::with_replay("test");
        let (seen, sink) = collector();
        let _sub = registry.subscribe(sink);
        assert!(seen.lock().unwrap().is_empty());

        let errors = ObserverRegistry::<u32>::without_replay("errors");
        errors.publish(&9);
        let (seen, sink) = collector();
        let _sub = errors.subscribe(sink);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(errors.latest(), None);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ObserverRegistry::<u32>::without_replay("test");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let _first = registry.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let _bad = registry.subscribe(|_| panic!("listener failure"));
        let c = calls.clone();
        let _last = registry.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(registry.publish(&1), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Registry still usable afterwards
        assert_eq!(registry.publish(&2), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = ObserverRegistry::<u32>::without_replay("test");
        let (seen, sink) = collector();
        let sub = registry.subscribe(sink);
        registry.publish(&1);
        sub.unsubscribe();
        registry.publish(&2);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_publish_while_stops_early() {
        let registry = ObserverRegistry::<u32>::with_replay("test");
        let (seen, sink) = collector();
        let _a = registry.subscribe(sink);
        let (seen_b, sink_b) = collector();
        let _b = registry.subscribe(sink_b);

        assert_eq!(registry.publish_while(&5, || false), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert!(seen_b.lock().unwrap().is_empty());
        // Nothing was delivered, so nothing is replayed either
        assert_eq!(registry.latest(), None);
    }

    #[test]
    fn test_cleared_replay_not_sent_to_new_subscribers() {
        let broadcaster = PositionBroadcaster::new();
        let record = PositionRecord {
            latitude: 37.7749,
            longitude: -122.4194,
            raw_latitude: 37.7749,
            raw_longitude: -122.4194,
            accuracy: 8.0,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: 1_000,
            source: crate::types::LocationSource::Gps,
            distance_from_previous: None,
            calculated_speed: None,
            validation_warning: None,
        };
        broadcaster.publish_position(&record, || true);

        broadcaster.clear_replay();
        let (seen, sink) = collector();
        let _sub = broadcaster.subscribe(sink);
        assert!(seen.lock().unwrap().is_empty());

        broadcaster.publish_position(&record, || true);
        assert_eq!(*seen.lock().unwrap(), vec![record]);
    }

    #[test]
    fn test_listener_can_subscribe_during_delivery() {
        let registry = Arc::new(ObserverRegistry::<u32>::without_replay("test"));
        let inner = registry.clone();
        let _sub = registry.subscribe(move |_| {
            let _ = inner.subscribe(|_| {});
        });
        registry.publish(&1);
        assert_eq!(registry.listener_count(), 2);
    }

    #[test]
    fn test_broadcaster_channels_are_separate() {
        let broadcaster = PositionBroadcaster::new();
        let (errors, sink) = collector();
        let _sub = broadcaster.subscribe_to_errors(sink);
        broadcaster.publish_error(&LocationError::PermissionDenied, || true);
        assert_eq!(*errors.lock().unwrap(), vec![LocationError::PermissionDenied]);
        assert_eq!(broadcaster.position_listener_count(), 0);
        assert_eq!(broadcaster.error_listener_count(), 1);
    }
}
