//! Event dispatch: feed filters, listener matching, failure isolation.

use crate::error::NotifyError;
use crate::event::ChangeEvent;
use crate::registry::{matches_all, Filter, ListenerRegistry};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Routes decoded events to matching registrations.
///
/// Shared between the manager and every feed worker; callbacks run on the
/// calling worker's thread.
pub(crate) struct Dispatcher {
    registry: ListenerRegistry,
    /// Collection-wide filters declared through `watch()`.
    feed_filters: RwLock<HashMap<String, Arc<[Filter]>>>,
    /// Events handed to `dispatch`, filtered or not.
    events_dispatched: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            registry: ListenerRegistry::new(),
            feed_filters: RwLock::new(HashMap::new()),
            events_dispatched: AtomicU64::new(0),
        }
    }

    pub(crate) fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Replace the feed filters of `collection`.
    pub(crate) fn set_feed_filters(&self, collection: &str, filters: Vec<Filter>) {
        debug!(collection = %collection, filters = filters.len(), "Feed filters replaced");
        self.feed_filters
            .write()
            .insert(collection.to_string(), Arc::from(filters));
    }

    pub(crate) fn feed_filters(&self, collection: &str) -> Option<Arc<[Filter]>> {
        self.feed_filters.read().get(collection).cloned()
    }

    pub(crate) fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    fn passes_feed_filters(&self, event: &ChangeEvent) -> bool {
        let Some(filters) = self.feed_filters(event.collection_name()) else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| matches_all(&filters, event))) {
            Ok(passed) => passed,
            Err(_) => {
                error!(
                    collection = %event.collection_name(),
                    "Feed filter panicked; dropping event"
                );
                false
            }
        }
    }

    /// Deliver `event` to every matching registration, in registration order.
    ///
    /// Returns the number of listeners invoked. A listener that fails or
    /// panics is logged and skipped; it never affects the others.
    pub(crate) fn dispatch(&self, event: &ChangeEvent) -> usize {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);

        if !self.passes_feed_filters(event) {
            debug!(event = %event, "Event rejected by feed filters");
            return 0;
        }

        let mut delivered = 0;
        for registration in self.registry.matching(event) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.deliver(event)));
            let failure = match outcome {
                Ok(None) => continue,
                Ok(Some(Ok(()))) => None,
                Ok(Some(Err(e))) => Some(NotifyError::Listener(e.to_string())),
                Err(payload) => Some(NotifyError::Listener(format!(
                    "panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            delivered += 1;

            if let Some(e) = failure {
                error!(
                    registration = %registration.id(),
                    collection = %event.collection_name(),
                    operation = %event.operation_type(),
                    error = %e,
                    "Listener failed"
                );
            }
        }

        debug!(event = %event, delivered, "Event dispatched");
        delivered
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
