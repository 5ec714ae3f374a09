//! Listener registry.
//!
//! Registrations pair a listener with a scope (one collection or all of
//! them) and an AND-composed list of filters:
//! - `FieldEquals`: top-level field of the full document equals a value
//! - `Predicate`: arbitrary closure over the event
//! - `OperationAllowList`: operation type is in a set
//!
//! # Example
//!
//! ```ignore
//! let registry = ListenerRegistry::new();
//!
//! let admins = listener(|event| {
//!     println!("admin changed: {}", event);
//!     Ok(())
//! });
//! registry.register(
//!     admins,
//!     Scope::collection("users"),
//!     vec![Filter::field_equals("role", "admin")],
//!     None,
//! );
//!
//! for registration in registry.matching(&event) {
//!     registration.deliver(&event);
//! }
//! ```

mod filter;
#[allow(clippy::module_inception)]
mod registry;
mod types;

pub use filter::{matches_all, EventPredicate, Filter};
pub use registry::{ListenerRegistration, ListenerRegistry};
pub use types::{listener, ChangeListener, Listener, ListenerResult, RegistrationId, Scope};
