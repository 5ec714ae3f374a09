//! Listener, scope and handle types.

use crate::event::ChangeEvent;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Outcome of a listener invocation. An `Err` is logged and isolated.
pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives change events.
///
/// Invoked synchronously on the feed thread of the event's collection, so
/// implementations should be fast or hand work off to their own executor.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> ListenerResult;
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) -> ListenerResult + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> ListenerResult {
        self(event)
    }
}

/// Shared listener handle. Identity is the `Arc` allocation.
pub type Listener = Arc<dyn ChangeListener>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&ChangeEvent) -> ListenerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Whether two handles point at the same listener.
pub(crate) fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Subscription breadth of a registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every collection.
    Global,
    /// A single collection.
    Collection(String),
    /// A fixed set of collections.
    Collections(BTreeSet<String>),
}

impl Scope {
    pub fn collection(name: impl Into<String>) -> Self {
        Scope::Collection(name.into())
    }

    /// Scope over several collections. A single name collapses to
    /// [`Scope::Collection`].
    pub fn collections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if names.len() == 1 {
            if let Some(name) = names.pop_first() {
                return Scope::Collection(name);
            }
        }
        Scope::Collections(names)
    }

    /// Whether events from `collection` fall inside this scope.
    pub fn covers(&self, collection: &str) -> bool {
        match self {
            Scope::Global => true,
            Scope::Collection(name) => name == collection,
            Scope::Collections(names) => names.contains(collection),
        }
    }

    /// Collections named by this scope; empty for [`Scope::Global`].
    pub fn collection_names(&self) -> Vec<&str> {
        match self {
            Scope::Global => Vec::new(),
            Scope::Collection(name) => vec![name.as_str()],
            Scope::Collections(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// This scope with `collection` taken out.
    ///
    /// `None` when nothing would remain. Global scope is never narrowed.
    pub(crate) fn without(&self, collection: &str) -> Option<Scope> {
        match self {
            Scope::Global => Some(Scope::Global),
            Scope::Collection(name) if name == collection => None,
            Scope::Collection(_) => Some(self.clone()),
            Scope::Collections(names) => {
                let rest: Vec<&String> = names.iter().filter(|n| *n != collection).collect();
                if rest.is_empty() {
                    None
                } else {
                    Some(Scope::collections(rest.into_iter().cloned()))
                }
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("*"),
            Scope::Collection(name) => f.write_str(name),
            Scope::Collections(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", names.join(","))
            }
        }
    }
}

impl From<&str> for Scope {
    fn from(name: &str) -> Self {
        Scope::Collection(name.to_string())
    }
}

impl From<String> for Scope {
    fn from(name: String) -> Self {
        Scope::Collection(name)
    }
}

impl From<Option<&str>> for Scope {
    fn from(name: Option<&str>) -> Self {
        name.map_or(Scope::Global, Scope::from)
    }
}

/// Handle identifying one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
