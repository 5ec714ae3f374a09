//! # Feedwatch
//!
//! Multiplexes per-collection document change feeds to in-process
//! listeners.
//!
//! ## Core Concepts
//!
//! - **Change events**: validated, immutable records of one insert, update,
//!   replace or delete
//! - **Feed workers**: one thread per watched collection, resuming from the
//!   last token after a failure
//! - **Registry**: listeners scoped to chosen collections or to all of them, with
//!   AND-composed filters
//! - **Manager**: run lifecycle, lazy worker creation and the registration
//!   API
//!
//! ## Example
//!
//! ```ignore
//! use feedwatch::{listener, ManagerConfig, MemoryStore, NotificationManager};
//!
//! let store = MemoryStore::new();
//! let manager = NotificationManager::new(ManagerConfig::default());
//! manager.start(Arc::new(store.clone()))?;
//!
//! manager
//!     .create_listener_builder(
//!         listener(|event| {
//!             println!("admin changed: {}", event);
//!             Ok(())
//!         }),
//!         "users",
//!     )
//!     .filter_field("role", "admin")
//!     .register()?;
//!
//! store.insert("users", json!({"name": "Alice", "role": "admin"}))?;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod manager;
pub mod registry;
pub mod types;

// Re-exports
pub use config::{ManagerConfig, ModeConflictPolicy, WorkerConfig};
pub use error::{NotifyError, Result};
pub use event::ChangeEvent;
pub use feed::{
    EventSink, FeedError, FeedSession, FeedSource, FeedWorker, MemoryStore, RawRecord,
    WorkerState, WorkerStatus,
};
pub use manager::{NotificationManager, RegistrationBuilder, WatchBuilder};
pub use registry::{
    listener, matches_all, ChangeListener, EventPredicate, Filter, Listener, ListenerRegistration,
    ListenerRegistry, ListenerResult, RegistrationId, Scope,
};
pub use types::*;
