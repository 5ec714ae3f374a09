//! Notification manager: run lifecycle, lazy feed workers, registration API.

use crate::config::{ManagerConfig, ModeConflictPolicy};
use crate::error::{NotifyError, Result};
use crate::event::ChangeEvent;
use crate::feed::{EventSink, FeedSource, FeedWorker, WorkerStatus};
use crate::registry::{Filter, Listener, RegistrationId, Scope};
use crate::types::RetrievalMode;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

use super::builder::{RegistrationBuilder, WatchBuilder};
use super::dispatch::Dispatcher;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Running,
    Stopped,
}

/// State owned by one start()/stop() cycle.
struct Lifecycle {
    state: RunState,
    /// Bumped by every start(), so a worker spawned for an earlier run is
    /// never adopted by a later one.
    run: u64,
    source: Option<Arc<dyn FeedSource>>,
    /// Retrieval mode of the current run, or the configured default.
    mode: RetrievalMode,
    workers: HashMap<String, FeedWorker>,
    /// Collections named through `watch()` during this cycle.
    watched: BTreeSet<String>,
}

/// Multiplexes per-collection change feeds to registered listeners.
///
/// One feed worker runs per collection of interest. Interest is declared by
/// registering a collection-scoped listener or by `watch()`; workers are
/// created lazily and live until `stop()`.
pub struct NotificationManager {
    config: ManagerConfig,
    /// Serializes start() and stop().
    transition: Mutex<()>,
    /// Serializes worker creation. Held while a worker opens its feed, so
    /// the lifecycle lock never is.
    spawning: Mutex<()>,
    lifecycle: RwLock<Lifecycle>,
    dispatcher: Arc<Dispatcher>,
    /// Handed to every worker.
    sink: EventSink,
}

impl NotificationManager {
    pub fn new(config: ManagerConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let sink_dispatcher = Arc::clone(&dispatcher);
        let sink: EventSink = Arc::new(move |event: &ChangeEvent| {
            sink_dispatcher.dispatch(event);
        });

        Self {
            lifecycle: RwLock::new(Lifecycle {
                state: RunState::NotStarted,
                run: 0,
                source: None,
                mode: config.default_mode,
                workers: HashMap::new(),
                watched: BTreeSet::new(),
            }),
            config,
            transition: Mutex::new(()),
            spawning: Mutex::new(()),
            dispatcher,
            sink,
        }
    }

    /// Process-wide instance with the default configuration.
    pub fn global() -> &'static NotificationManager {
        static GLOBAL: OnceLock<NotificationManager> = OnceLock::new();
        GLOBAL.get_or_init(|| NotificationManager::new(ManagerConfig::default()))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // --- Lifecycle ---

    /// Start a run in the configured default retrieval mode.
    pub fn start(&self, source: Arc<dyn FeedSource>) -> Result<()> {
        self.start_with_mode(source, self.config.default_mode)
    }

    /// Start a run in `mode`.
    ///
    /// Collections already holding registrations, or watched before this
    /// call, get their workers now; everything else waits for interest. If
    /// one of those workers cannot be created the run is rolled back and
    /// the manager is left as it was.
    pub fn start_with_mode(&self, source: Arc<dyn FeedSource>, mode: RetrievalMode) -> Result<()> {
        let _transition = self.transition.lock();

        let (previous, pending) = {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state == RunState::Running {
                return Err(NotifyError::AlreadyRunning);
            }

            let previous = lifecycle.state;
            lifecycle.state = RunState::Running;
            lifecycle.run += 1;
            lifecycle.source = Some(source);
            lifecycle.mode = mode;

            let mut pending = self.dispatcher.registry().collections();
            pending.extend(lifecycle.watched.iter().cloned());
            (previous, pending)
        };
        info!(mode = %mode, "Notification manager started");

        for collection in &pending {
            if let Err(e) = self.ensure_worker(collection) {
                error!(collection = %collection, error = %e, "Start failed; rolling back");
                self.wind_down(previous, false);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Stop every worker and end the run. Registrations are kept.
    ///
    /// Stopping a manager that is not running only logs a warning.
    pub fn stop(&self) -> Result<()> {
        let _transition = self.transition.lock();

        if self.lifecycle.read().state != RunState::Running {
            warn!("Notification manager is not running; nothing to stop");
            return Ok(());
        }

        let count = self.wind_down(RunState::Stopped, true);
        info!(workers = count, "Notification manager stopped");
        Ok(())
    }

    /// End the current run, leaving the manager in `state`. Returns the
    /// number of workers stopped.
    fn wind_down(&self, state: RunState, forget_watched: bool) -> usize {
        let workers = {
            let mut lifecycle = self.lifecycle.write();
            lifecycle.state = state;
            lifecycle.source = None;
            lifecycle.mode = self.config.default_mode;
            if forget_watched {
                lifecycle.watched.clear();
            }
            std::mem::take(&mut lifecycle.workers)
        };

        // Workers are stopped without the lifecycle lock so their callbacks
        // can still reach the manager while they drain.
        let count = workers.len();
        for (_, mut worker) in workers {
            worker.stop();
        }
        count
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.read().state == RunState::Running
    }

    /// Spawn the worker for `collection` unless a live one exists.
    ///
    /// A worker that exited is replaced, resuming from its last token. The
    /// lifecycle lock is released while the new worker opens its feed.
    fn ensure_worker(&self, collection: &str) -> Result<()> {
        let _spawning = self.spawning.lock();

        let (run, mode, source, resume_token) = {
            let lifecycle = self.lifecycle.read();
            if lifecycle.state != RunState::Running {
                return Ok(());
            }
            let Some(source) = lifecycle.source.clone() else {
                return Ok(());
            };
            let resume_token = match lifecycle.workers.get(collection) {
                Some(worker) if !worker.is_stopped() => return Ok(()),
                Some(worker) => {
                    info!(collection = %collection, "Replacing stopped feed worker");
                    worker.resume_token()
                }
                None => None,
            };
            (lifecycle.run, lifecycle.mode, source, resume_token)
        };

        let mut worker = FeedWorker::start(
            collection,
            mode,
            source,
            resume_token,
            &self.config.worker,
            Arc::clone(&self.sink),
        )?;

        let mut lifecycle = self.lifecycle.write();
        if lifecycle.state == RunState::Running && lifecycle.run == run {
            lifecycle.workers.insert(collection.to_string(), worker);
            return Ok(());
        }
        drop(lifecycle);

        debug!(collection = %collection, "Run ended while the worker started; stopping it");
        worker.stop();
        Ok(())
    }

    // --- Registration ---

    /// Register `listener` for `scope`: a collection name,
    /// `Scope::collections([..])` or `Scope::Global`.
    pub fn register_listener(
        &self,
        listener: Listener,
        scope: impl Into<Scope>,
    ) -> Result<RegistrationId> {
        self.register(listener, scope.into(), Vec::new(), None)
    }

    /// Register with a requested retrieval mode.
    ///
    /// Delivery always follows the run's mode; under
    /// `ModeConflictPolicy::Reject` a different request is refused.
    pub fn register_listener_with_mode(
        &self,
        listener: Listener,
        scope: impl Into<Scope>,
        requested_mode: RetrievalMode,
    ) -> Result<RegistrationId> {
        self.register(listener, scope.into(), Vec::new(), Some(requested_mode))
    }

    /// Start a filtered registration.
    pub fn create_listener_builder(
        &self,
        listener: Listener,
        scope: impl Into<Scope>,
    ) -> RegistrationBuilder<'_> {
        RegistrationBuilder::new(self, listener, scope.into())
    }

    pub(crate) fn register(
        &self,
        listener: Listener,
        scope: Scope,
        filters: Vec<Filter>,
        requested_mode: Option<RetrievalMode>,
    ) -> Result<RegistrationId> {
        if let Some(requested) = requested_mode {
            self.check_mode(requested)?;
        }

        let collections: Vec<String> = scope
            .collection_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let scope_label = scope.to_string();
        let id = self
            .dispatcher
            .registry()
            .register(listener, scope, filters, requested_mode);
        info!(registration = %id, scope = %scope_label, "Listener registered");

        for collection in &collections {
            if let Err(e) = self.ensure_worker(collection) {
                self.dispatcher.registry().unregister_id(id);
                return Err(e);
            }
        }

        Ok(id)
    }

    /// Declare interest in `collection` without a listener.
    pub fn watch(&self, collection: impl Into<String>) -> WatchBuilder<'_> {
        WatchBuilder::new(self, vec![collection.into()])
    }

    /// Declare interest in several collections at once.
    pub fn watch_collections<I, S>(&self, collections: I) -> WatchBuilder<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WatchBuilder::new(self, collections.into_iter().map(Into::into).collect())
    }

    pub(crate) fn declare_interest(
        &self,
        collections: &[String],
        filters: Vec<Filter>,
        requested_mode: Option<RetrievalMode>,
    ) -> Result<()> {
        if let Some(requested) = requested_mode {
            self.check_mode(requested)?;
        }

        if !filters.is_empty() {
            for collection in collections {
                self.dispatcher.set_feed_filters(collection, filters.clone());
            }
        }

        self.lifecycle
            .write()
            .watched
            .extend(collections.iter().cloned());
        for collection in collections {
            self.ensure_worker(collection)?;
        }
        Ok(())
    }

    fn check_mode(&self, requested: RetrievalMode) -> Result<()> {
        let active = self.default_retrieval_mode();
        if requested == active {
            return Ok(());
        }
        match self.config.mode_conflict {
            ModeConflictPolicy::Ignore => {
                warn!(
                    requested = %requested,
                    active = %active,
                    "Requested retrieval mode ignored; the run's mode applies"
                );
                Ok(())
            }
            ModeConflictPolicy::Reject => Err(NotifyError::ModeConflict { requested, active }),
        }
    }

    /// Remove every registration of `listener`. Workers keep running.
    ///
    /// May be called from inside a callback, including for a listener whose
    /// delivery is in flight on another collection's thread.
    pub fn unregister_listener(&self, listener: &Listener) -> usize {
        self.dispatcher.registry().unregister(listener)
    }

    /// Stop delivering `collection` to `listener`.
    ///
    /// Its registrations for other collections, and global ones, stay. The
    /// collection's worker keeps running. Returns how many registrations
    /// were removed or narrowed.
    pub fn unregister_listener_from(&self, listener: &Listener, collection: &str) -> usize {
        self.dispatcher.registry().unregister_from(listener, collection)
    }

    pub fn unregister_registration(&self, id: RegistrationId) -> bool {
        self.dispatcher.registry().unregister_id(id)
    }

    /// Remove all registrations. Workers keep running.
    pub fn clear_all_listeners(&self) -> usize {
        self.dispatcher.registry().clear_all()
    }

    // --- Dispatch ---

    /// Deliver `event` to matching listeners on the calling thread.
    ///
    /// Feed workers call this for every decoded record. Returns the number
    /// of listeners invoked.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        self.dispatcher.dispatch(event)
    }

    // --- Inspection ---

    /// Mode in which `collection` is delivered: always the run's mode.
    pub fn compute_effective_mode(&self, _collection: &str) -> RetrievalMode {
        self.default_retrieval_mode()
    }

    /// Mode of the current run, or the configured default when not running.
    pub fn default_retrieval_mode(&self) -> RetrievalMode {
        self.lifecycle.read().mode
    }

    /// Whether the worker for `collection` is starting or streaming.
    pub fn is_watching(&self, collection: &str) -> bool {
        self.lifecycle
            .read()
            .workers
            .get(collection)
            .is_some_and(FeedWorker::is_active)
    }

    pub fn listener_count(&self) -> usize {
        self.dispatcher.registry().len()
    }

    /// Collections whose worker has not stopped.
    pub fn watched_collections(&self) -> BTreeSet<String> {
        self.lifecycle
            .read()
            .workers
            .iter()
            .filter(|(_, worker)| !worker.is_stopped())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Status of every worker of the run, sorted by collection.
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<_> = self
            .lifecycle
            .read()
            .workers
            .values()
            .map(FeedWorker::status)
            .collect();
        statuses.sort_by(|a, b| a.collection.cmp(&b.collection));
        statuses
    }

    /// Mode of each live worker.
    pub fn collection_modes(&self) -> BTreeMap<String, RetrievalMode> {
        self.lifecycle
            .read()
            .workers
            .iter()
            .filter(|(_, worker)| !worker.is_stopped())
            .map(|(name, worker)| (name.clone(), worker.mode()))
            .collect()
    }

    /// Events handed to dispatch since construction.
    pub fn total_events_processed(&self) -> u64 {
        self.dispatcher.events_dispatched()
    }

    /// Feed filters declared for `collection`.
    pub fn feed_filters(&self, collection: &str) -> Vec<Filter> {
        self.dispatcher
            .feed_filters(collection)
            .map(|filters| filters.to_vec())
            .unwrap_or_default()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}
