//! Listener filters, AND-composed.

use crate::event::ChangeEvent;
use crate::types::OperationType;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Predicate over a change event.
pub type EventPredicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// A single condition a registration places on events.
#[derive(Clone)]
pub enum Filter {
    /// Top-level field of the full document equals `value`.
    /// Never matches an event without a full document.
    FieldEquals {
        key: String,
        value: serde_json::Value,
    },
    /// Arbitrary caller-supplied predicate.
    Predicate(EventPredicate),
    /// Operation type is one of the listed ones.
    OperationAllowList(HashSet<OperationType>),
}

impl Filter {
    pub fn field_equals(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Filter::FieldEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Arc::new(f))
    }

    pub fn operations(ops: impl IntoIterator<Item = OperationType>) -> Self {
        Filter::OperationAllowList(ops.into_iter().collect())
    }

    /// Evaluate against one event.
    pub fn evaluate(&self, event: &ChangeEvent) -> bool {
        match self {
            Filter::FieldEquals { key, value } => event.field(key) == Some(value),
            Filter::Predicate(predicate) => predicate(event),
            Filter::OperationAllowList(ops) => ops.contains(&event.operation_type()),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::FieldEquals { key, value } => write!(f, "FieldEquals({} == {})", key, value),
            Filter::Predicate(_) => f.write_str("Predicate(..)"),
            Filter::OperationAllowList(ops) => {
                let mut ops: Vec<_> = ops.iter().collect();
                ops.sort();
                write!(f, "OperationAllowList({:?})", ops)
            }
        }
    }
}

/// True when every filter accepts the event. An empty list accepts everything.
pub fn matches_all(filters: &[Filter], event: &ChangeEvent) -> bool {
    filters.iter().all(|filter| filter.evaluate(event))
}
