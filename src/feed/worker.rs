//! Per-collection feed worker.
//!
//! Each worker owns one background thread holding the collection's single
//! feed session. Records are decoded and handed to the event sink in feed
//! order; the resume token is persisted after each one so a reconnect picks
//! up where the last session stopped.

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::types::{ResumeToken, RetrievalMode};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::source::{FeedError, FeedSession, FeedSource, RawRecord};

/// Callback receiving every decoded event of a worker's collection.
pub type EventSink = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Lifecycle state of a feed worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Thread exited (stop requested or unrecoverable error).
    Stopped,
    /// Opening the first session.
    Starting,
    /// Session open, draining records.
    Running,
    /// Waiting to reopen after a failure.
    Backoff,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a worker.
#[derive(Clone, Debug)]
pub struct WorkerStatus {
    pub collection: String,
    pub state: WorkerState,
    pub mode: RetrievalMode,
    pub events_processed: u64,
    pub consecutive_failures: u32,
    pub resume_token: Option<ResumeToken>,
}

/// State shared between the worker handle and its thread.
struct Shared {
    collection: String,
    mode: RetrievalMode,
    state: Mutex<WorkerState>,
    resume_token: Mutex<Option<ResumeToken>>,
    events_processed: AtomicU64,
    consecutive_failures: AtomicU32,
    stop_requested: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Marks the worker stopped and releases the exit channel when the thread
/// ends, including by panic.
struct ExitGuard {
    shared: Arc<Shared>,
    _done: Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.set_state(WorkerState::Stopped);
    }
}

/// Handle to a running feed worker.
pub struct FeedWorker {
    shared: Arc<Shared>,
    /// Dropped to wake the thread out of a backoff sleep.
    shutdown_tx: Option<Sender<()>>,
    /// Disconnects when the thread exits.
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl FeedWorker {
    /// Spawn the worker thread for `collection`.
    ///
    /// Waits up to `config.connect_timeout` for the first open attempt to
    /// report. A slow or transiently failing open is retried in the
    /// background; a fatal one fails this call.
    pub fn start(
        collection: &str,
        mode: RetrievalMode,
        source: Arc<dyn FeedSource>,
        resume_token: Option<ResumeToken>,
        config: &WorkerConfig,
        on_event: EventSink,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            collection: collection.to_string(),
            mode,
            state: Mutex::new(WorkerState::Starting),
            resume_token: Mutex::new(resume_token),
            events_processed: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<FirstOpen>(1);

        let feed_loop = FeedLoop {
            shared: Arc::clone(&shared),
            source,
            config: config.clone(),
            on_event,
            shutdown_rx,
            ready_tx: Some(ready_tx),
        };
        let guard = ExitGuard {
            shared: Arc::clone(&shared),
            _done: done_tx,
        };

        let handle = thread::Builder::new()
            .name(format!("feed-{}", collection))
            .spawn(move || {
                let _guard = guard;
                feed_loop.run();
            })?;

        match ready_rx.recv_timeout(config.connect_timeout) {
            Ok(FirstOpen::Opened) => debug!(collection = %collection, "Change feed session open"),
            Ok(FirstOpen::Retrying) => warn!(
                collection = %collection,
                "First change feed open failed; retrying in background"
            ),
            Ok(FirstOpen::Failed(e)) => {
                // The loop exits right after reporting a fatal open.
                if handle.join().is_err() {
                    error!(collection = %collection, "Feed worker thread panicked");
                }
                return Err(e.into());
            }
            Err(_) => warn!(
                collection = %collection,
                timeout_ms = config.connect_timeout.as_millis() as u64,
                "Change feed not open within connect timeout"
            ),
        }

        Ok(Self {
            shared,
            shutdown_tx: Some(shutdown_tx),
            done_rx,
            handle: Some(handle),
            stop_timeout: config.stop_timeout,
        })
    }

    /// Request shutdown and wait for the thread, up to the stop timeout.
    pub fn stop(&mut self) {
        self.request_stop();

        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            warn!(
                collection = %self.shared.collection,
                "Feed worker stopped from its own thread; not waiting for exit"
            );
            return;
        }

        match self.done_rx.recv_timeout(self.stop_timeout) {
            Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(collection = %self.shared.collection, "Feed worker thread panicked");
                }
                info!(collection = %self.shared.collection, "Feed worker stopped");
            }
            Ok(()) | Err(RecvTimeoutError::Timeout) => {
                warn!(
                    collection = %self.shared.collection,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Feed worker did not stop in time; abandoning thread"
                );
            }
        }
    }

    fn request_stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shutdown_tx.take();
    }

    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    pub fn mode(&self) -> RetrievalMode {
        self.shared.mode
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Starting or Running.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), WorkerState::Starting | WorkerState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Token of the last record processed.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.shared.resume_token.lock().clone()
    }

    pub fn events_processed(&self) -> u64 {
        self.shared.events_processed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            collection: self.shared.collection.clone(),
            state: self.state(),
            mode: self.shared.mode,
            events_processed: self.events_processed(),
            consecutive_failures: self.shared.consecutive_failures.load(Ordering::Relaxed),
            resume_token: self.resume_token(),
        }
    }
}

impl Drop for FeedWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_stop();
        }
    }
}

impl fmt::Debug for FeedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedWorker")
            .field("collection", &self.shared.collection)
            .field("mode", &self.shared.mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Body of the worker thread.
struct FeedLoop {
    shared: Arc<Shared>,
    source: Arc<dyn FeedSource>,
    config: WorkerConfig,
    on_event: EventSink,
    shutdown_rx: Receiver<()>,
    ready_tx: Option<Sender<FirstOpen>>,
}

/// Outcome of the first open attempt, reported to `FeedWorker::start`.
enum FirstOpen {
    Opened,
    Retrying,
    Failed(FeedError),
}

impl FeedLoop {
    fn run(mut self) {
        let collection = self.shared.collection.clone();
        info!(collection = %collection, mode = %self.shared.mode, "Feed worker started");

        while !self.shared.stop_requested() {
            let token = self.shared.resume_token.lock().clone();
            if let Some(ref token) = token {
                debug!(collection = %collection, token = ?token, "Opening change feed from resume token");
            }

            let outcome = match self
                .source
                .open_change_feed(&collection, self.shared.mode, token.as_ref())
            {
                Ok(session) => {
                    self.shared.set_state(WorkerState::Running);
                    self.shared.consecutive_failures.store(0, Ordering::Relaxed);
                    self.signal_ready(FirstOpen::Opened);
                    self.drain(session)
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.signal_ready(FirstOpen::Failed(e.clone()));
                    } else {
                        self.shared.set_state(WorkerState::Backoff);
                        self.signal_ready(FirstOpen::Retrying);
                    }
                    Err(e)
                }
            };

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }

        debug!(collection = %collection, "Feed worker loop exited");
    }

    fn signal_ready(&mut self, outcome: FirstOpen) {
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.try_send(outcome);
        }
    }

    /// Read records until shutdown (`Ok`) or a session failure (`Err`).
    fn drain(&self, mut session: Box<dyn FeedSession>) -> std::result::Result<(), FeedError> {
        while !self.shared.stop_requested() {
            if let Some(raw) = session.next_record(self.config.poll_interval)? {
                self.process(raw);
            }
        }
        Ok(())
    }

    fn process(&self, raw: RawRecord) {
        let token = raw.resume_token.clone();

        match ChangeEvent::decode(raw, &self.shared.collection, self.shared.mode) {
            Ok(event) => {
                self.shared.events_processed.fetch_add(1, Ordering::Relaxed);
                (self.on_event)(&event);
            }
            Err(e) => warn!(
                collection = %self.shared.collection,
                error = %e,
                "Skipping malformed change record"
            ),
        }

        if let Some(token) = token {
            *self.shared.resume_token.lock() = Some(token);
        }
    }

    /// Handle a failure. Returns false when the worker must exit.
    fn recover(&self, error: FeedError) -> bool {
        let collection = &self.shared.collection;

        match error {
            FeedError::Fatal(msg) => {
                error!(collection = %collection, error = %msg, "Change feed failed permanently");
                false
            }
            FeedError::InvalidResumeToken(msg) => {
                warn!(
                    collection = %collection,
                    error = %msg,
                    "Resume token rejected; restarting from the current position"
                );
                *self.shared.resume_token.lock() = None;
                self.shared.set_state(WorkerState::Backoff);
                self.sleep(self.config.invalid_token_delay)
            }
            FeedError::Transient(msg) => {
                let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(max) = self.config.max_consecutive_failures {
                    if failures >= max {
                        error!(
                            collection = %collection,
                            error = %msg,
                            failures,
                            "Change feed kept failing; giving up"
                        );
                        return false;
                    }
                }

                let delay = self.config.backoff_for(failures);
                self.shared.set_state(WorkerState::Backoff);
                warn!(
                    collection = %collection,
                    error = %msg,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Change feed failed; reconnecting after backoff"
                );
                self.sleep(delay)
            }
        }
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    fn sleep(&self, delay: Duration) -> bool {
        match self.shutdown_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => !self.shared.stop_requested(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::feed::MemoryStore;
    use crossbeam_channel::unbounded;
    use serde_json::json;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(5))
            .with_invalid_token_delay(Duration::from_millis(5))
    }

    fn collecting_sink() -> (EventSink, Receiver<ChangeEvent>) {
        let (tx, rx) = unbounded();
        let sink: EventSink = Arc::new(move |event: &ChangeEvent| {
            let _ = tx.send(event.clone());
        });
        (sink, rx)
    }

    fn wait_for_state(worker: &FeedWorker, state: WorkerState) {
        let deadline = Instant::now() + TIMEOUT;
        while worker.state() != state {
            assert!(Instant::now() < deadline, "worker never reached {}", state);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_delivers_in_feed_order() {
        let store = MemoryStore::new();
        let (sink, rx) = collecting_sink();
        let mut worker = FeedWorker::start(
            "users",
            RetrievalMode::UpdateLookup,
            Arc::new(store.clone()),
            None,
            &fast_config(),
            sink,
        )
        .unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        let key = store.insert("users", json!({"name": "Alice"})).unwrap();
        store.set_field("users", &key, "name", "Alice2").unwrap();
        store.delete("users", &key);

        let ops: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(TIMEOUT).unwrap().operation_type())
            .collect();
        assert_eq!(
            ops,
            vec![
                crate::types::OperationType::Insert,
                crate::types::OperationType::Update,
                crate::types::OperationType::Delete
            ]
        );
        assert_eq!(worker.events_processed(), 3);
        assert!(worker.resume_token().is_some());

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_skips_malformed_record() {
        let store = MemoryStore::new();
        let (sink, rx) = collecting_sink();
        let mut worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            None,
            &fast_config(),
            sink,
        )
        .unwrap();

        store.insert("users", json!({"n": 1})).unwrap();
        store.push_raw(
            "users",
            RawRecord {
                operation_type: "mystery".into(),
                ..Default::default()
            },
        );
        store.insert("users", json!({"n": 2})).unwrap();

        let first = rx.recv_timeout(TIMEOUT).unwrap();
        let second = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(first.field("n"), Some(&json!(1)));
        assert_eq!(second.field("n"), Some(&json!(2)));
        assert_eq!(worker.events_processed(), 2);

        worker.stop();
    }

    #[test]
    fn test_reconnects_after_interruption() {
        let store = MemoryStore::new();
        let (sink, rx) = collecting_sink();
        let mut worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            None,
            &fast_config(),
            sink,
        )
        .unwrap();

        store.insert("users", json!({"n": 1})).unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();

        store.interrupt_sessions("users", FeedError::Transient("connection reset".into()));
        store.insert("users", json!({"n": 2})).unwrap();

        let event = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event.field("n"), Some(&json!(2)));
        wait_for_state(&worker, WorkerState::Running);

        worker.stop();
    }

    #[test]
    fn test_fatal_error_stops_worker() {
        let store = MemoryStore::new();
        let (sink, _rx) = collecting_sink();
        let worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            None,
            &fast_config(),
            sink,
        )
        .unwrap();

        store.interrupt_sessions("users", FeedError::Fatal("collection dropped".into()));
        wait_for_state(&worker, WorkerState::Stopped);
        assert!(!worker.is_active());
    }

    #[test]
    fn test_fatal_first_open_fails_start() {
        let store = MemoryStore::new();
        store.fail_next_open("users", FeedError::Fatal("no such collection".into()));
        let (sink, _rx) = collecting_sink();

        let result = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            None,
            &fast_config(),
            sink,
        );
        assert!(matches!(
            result,
            Err(NotifyError::Feed(FeedError::Fatal(ref msg))) if msg == "no such collection"
        ));
    }

    #[test]
    fn test_gives_up_after_max_failures() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.fail_next_open("users", FeedError::Transient("refused".into()));
        }
        let (sink, _rx) = collecting_sink();
        let worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            None,
            &fast_config().with_max_consecutive_failures(2),
            sink,
        )
        .unwrap();

        wait_for_state(&worker, WorkerState::Stopped);
        assert_eq!(worker.status().consecutive_failures, 2);
    }

    #[test]
    fn test_invalid_token_restarts_from_current_position() {
        let store = MemoryStore::new();
        let (sink, rx) = collecting_sink();
        let mut worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store.clone()),
            Some(ResumeToken(vec![0, 1, 2, 3, 4])),
            &fast_config(),
            sink,
        )
        .unwrap();

        wait_for_state(&worker, WorkerState::Running);
        store.insert("users", json!({"n": 1})).unwrap();
        let event = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event.field("n"), Some(&json!(1)));

        worker.stop();
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let store = MemoryStore::new();
        store.fail_next_open("users", FeedError::Transient("refused".into()));
        let (sink, _rx) = collecting_sink();
        let config = fast_config().with_backoff(Duration::from_secs(60), Duration::from_secs(60));
        let mut worker = FeedWorker::start(
            "users",
            RetrievalMode::Default,
            Arc::new(store),
            None,
            &config,
            sink,
        )
        .unwrap();

        wait_for_state(&worker, WorkerState::Backoff);
        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(worker.is_stopped());
    }
}
