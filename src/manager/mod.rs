//! Notification manager.
//!
//! Owns the run lifecycle, the listener registry and one feed worker per
//! collection of interest. Each worker hands decoded events back to the
//! dispatcher, which invokes matching listeners on the worker's thread in
//! registration order.
//!
//! # Example
//!
//! ```ignore
//! let manager = NotificationManager::new(ManagerConfig::default());
//! manager.start(Arc::new(store))?;
//!
//! manager.register_listener(
//!     listener(|event| {
//!         println!("{}", event);
//!         Ok(())
//!     }),
//!     "users",
//! )?;
//!
//! manager.watch("audit").only_inserts().start()?;
//! ```

mod builder;
mod dispatch;
#[allow(clippy::module_inception)]
mod manager;

pub use builder::{RegistrationBuilder, WatchBuilder};
pub use manager::NotificationManager;
