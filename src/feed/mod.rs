//! Change feeds.
//!
//! A [`FeedSource`] opens resumable per-collection sessions; a
//! [`FeedWorker`] owns one session on its own thread and reconnects with
//! backoff when it fails. [`MemoryStore`] is an in-process source used by
//! the tests and benchmarks.

mod memory;
mod source;
mod worker;

pub use memory::MemoryStore;
pub use source::{FeedError, FeedSession, FeedSource, RawRecord};
pub use worker::{EventSink, FeedWorker, WorkerState, WorkerStatus};
