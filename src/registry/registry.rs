//! Listener registry: registration bookkeeping and event matching.

use crate::event::ChangeEvent;
use crate::types::{RetrievalMode, Timestamp};
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use super::filter::{matches_all, Filter};
use super::types::{same_listener, Listener, ListenerResult, RegistrationId, Scope};

thread_local! {
    /// Listener invocations in progress on this thread.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running a listener until dropped.
struct DeliveryMark;

impl DeliveryMark {
    fn enter() -> Self {
        DELIVERING.with(|depth| depth.set(depth.get() + 1));
        DeliveryMark
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn in_delivery() -> bool {
    DELIVERING.with(|depth| depth.get() > 0)
}

/// One (listener, scope, filters) registration.
pub struct ListenerRegistration {
    id: RegistrationId,
    listener: Listener,
    /// Narrowed in place when the listener leaves one of its collections.
    scope: RwLock<Scope>,
    filters: Vec<Filter>,
    /// Mode asked for at registration. Kept for inspection only.
    requested_mode: Option<RetrievalMode>,
    created: Timestamp,
    active: AtomicBool,
    /// Held for the duration of a delivery. Reentrant so a callback may
    /// dispatch again on its own thread.
    gate: ReentrantMutex<()>,
}

impl ListenerRegistration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn scope(&self) -> Scope {
        self.scope.read().clone()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn requested_mode(&self) -> Option<RetrievalMode> {
        self.requested_mode
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Scope and filter check. A panicking predicate counts as a non-match.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if !self.scope.read().covers(event.collection_name()) {
            return false;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| matches_all(&self.filters, event))) {
            Ok(accepted) => accepted,
            Err(_) => {
                error!(registration = %self.id, "Filter predicate panicked; treating as no match");
                false
            }
        }
    }

    /// Invoke the listener unless the registration has been removed or no
    /// longer covers the event's collection.
    ///
    /// Returns `None` when nothing was invoked.
    pub fn deliver(&self, event: &ChangeEvent) -> Option<ListenerResult> {
        let _gate = self.gate.lock();
        if !self.is_active() || !self.scope.read().covers(event.collection_name()) {
            return None;
        }
        let _mark = DeliveryMark::enter();
        Some(self.listener.on_change(event))
    }

    /// Wait out a delivery in flight on another thread.
    ///
    /// Skipped when the caller is itself running a listener: two callbacks
    /// removing each other would otherwise wait on each other forever. The
    /// in-flight delivery then finishes on its own; no new one starts.
    fn settle(&self) {
        if !in_delivery() {
            drop(self.gate.lock());
        }
    }

    /// Stop further deliveries.
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.settle();
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("scope", &*self.scope.read())
            .field("filters", &self.filters)
            .field("requested_mode", &self.requested_mode)
            .field("created", &self.created)
            .finish()
    }
}

/// Thread-safe store of listener registrations.
///
/// Readers take a copy-on-write snapshot, so dispatch never runs a callback
/// while holding the registry lock.
pub struct ListenerRegistry {
    /// Registrations in registration order.
    registrations: RwLock<Arc<[Arc<ListenerRegistration>]>>,
    /// Counter for generating registration IDs.
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a registration and return its handle.
    pub fn register(
        &self,
        listener: Listener,
        scope: Scope,
        filters: Vec<Filter>,
        requested_mode: Option<RetrievalMode>,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Arc::new(ListenerRegistration {
            id,
            listener,
            scope: RwLock::new(scope),
            filters,
            requested_mode,
            created: Timestamp::now(),
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        });

        let mut regs = self.registrations.write();
        let mut next: Vec<_> = regs.iter().cloned().collect();
        next.push(registration);
        *regs = next.into();

        id
    }

    /// Remove every registration of `listener`. Returns how many were removed.
    ///
    /// Once this returns, the listener receives no further events. Called
    /// from inside a callback, a delivery already running on another thread
    /// may still complete.
    pub fn unregister(&self, listener: &Listener) -> usize {
        let removed = self.remove_where(|reg| same_listener(&reg.listener, listener));
        removed.len()
    }

    /// Take `collection` out of every non-global registration of `listener`.
    ///
    /// Registrations left with no collection are removed; multi-collection
    /// ones keep their other collections. Returns how many were touched.
    pub fn unregister_from(&self, listener: &Listener, collection: &str) -> usize {
        let mut narrowed = Vec::new();
        let removed: Vec<_> = {
            let mut regs = self.registrations.write();
            let mut kept = Vec::with_capacity(regs.len());
            let mut removed = Vec::new();
            for reg in regs.iter() {
                let scope = reg.scope();
                if !same_listener(&reg.listener, listener)
                    || scope == Scope::Global
                    || !scope.covers(collection)
                {
                    kept.push(Arc::clone(reg));
                    continue;
                }
                match scope.without(collection) {
                    Some(rest) => {
                        *reg.scope.write() = rest;
                        narrowed.push(Arc::clone(reg));
                        kept.push(Arc::clone(reg));
                    }
                    None => removed.push(Arc::clone(reg)),
                }
            }
            if !removed.is_empty() {
                *regs = kept.into();
            }
            removed
        };

        for reg in &narrowed {
            reg.settle();
            debug!(registration = %reg.id, collection = %collection, "Listener left collection");
        }
        self.retire(&removed);

        narrowed.len() + removed.len()
    }

    /// Remove one registration by handle.
    pub fn unregister_id(&self, id: RegistrationId) -> bool {
        !self.remove_where(|reg| reg.id == id).is_empty()
    }

    /// Drop every registration. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        self.remove_where(|_| true).len()
    }

    /// Registrations that accept `event`, in registration order.
    pub fn matching(&self, event: &ChangeEvent) -> Vec<Arc<ListenerRegistration>> {
        self.snapshot()
            .iter()
            .filter(|reg| reg.accepts(event))
            .cloned()
            .collect()
    }

    /// Consistent view of the current registrations.
    pub fn snapshot(&self) -> Arc<[Arc<ListenerRegistration>]> {
        self.registrations.read().clone()
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Collections named by at least one non-global registration.
    pub fn collections(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for reg in self.snapshot().iter() {
            let scope = reg.scope.read();
            names.extend(scope.collection_names().into_iter().map(str::to_string));
        }
        names
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<Arc<ListenerRegistration>>
    where
        F: Fn(&ListenerRegistration) -> bool,
    {
        let removed: Vec<_> = {
            let mut regs = self.registrations.write();
            let (removed, kept): (Vec<_>, Vec<_>) =
                regs.iter().cloned().partition(|reg| predicate(reg));
            if !removed.is_empty() {
                *regs = kept.into();
            }
            removed
        };

        self.retire(&removed);
        removed
    }

    /// Deactivate removed registrations, outside the registry lock.
    fn retire(&self, removed: &[Arc<ListenerRegistration>]) {
        for reg in removed {
            reg.deactivate();
            debug!(registration = %reg.id, scope = %reg.scope.read(), "Listener registration removed");
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
