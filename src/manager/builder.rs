//! Chainable registration and watch builders.

use crate::error::Result;
use crate::event::ChangeEvent;
use crate::registry::{Filter, Listener, RegistrationId, Scope};
use crate::types::{OperationType, RetrievalMode};
use std::collections::HashSet;

use super::manager::NotificationManager;

/// Builds a listener registration with AND-composed filters.
///
/// ```ignore
/// manager
///     .create_listener_builder(on_admin_change, "users")
///     .filter_field("role", "admin")
///     .filter_operation([OperationType::Insert, OperationType::Update])
///     .register()?;
/// ```
#[must_use = "builders do nothing until `register` is called"]
pub struct RegistrationBuilder<'a> {
    manager: &'a NotificationManager,
    listener: Listener,
    scope: Scope,
    filters: Vec<Filter>,
    requested_mode: Option<RetrievalMode>,
}

impl<'a> RegistrationBuilder<'a> {
    pub(crate) fn new(manager: &'a NotificationManager, listener: Listener, scope: Scope) -> Self {
        Self {
            manager,
            listener,
            scope,
            filters: Vec::new(),
            requested_mode: None,
        }
    }

    /// Request a retrieval mode. Delivery still follows the run's mode.
    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.requested_mode = Some(mode);
        self
    }

    /// Only events whose full document has `key == value`.
    pub fn filter_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.filters.push(Filter::field_equals(key, value));
        self
    }

    /// Only events accepted by `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Filter::predicate(predicate));
        self
    }

    /// Only the listed operation types.
    pub fn filter_operation(mut self, ops: impl IntoIterator<Item = OperationType>) -> Self {
        self.filters.push(Filter::operations(ops));
        self
    }

    /// Only events from the named collections.
    pub fn filter_collection<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        self.filters.push(Filter::predicate(move |event| {
            names.contains(event.collection_name())
        }));
        self
    }

    pub fn register(self) -> Result<RegistrationId> {
        self.manager
            .register(self.listener, self.scope, self.filters, self.requested_mode)
    }
}

/// Declares interest in collections, optionally with feed filters.
///
/// Feed filters apply to every event of the collection before any listener
/// sees it, global listeners included.
#[must_use = "builders do nothing until `start` is called"]
pub struct WatchBuilder<'a> {
    manager: &'a NotificationManager,
    collections: Vec<String>,
    operations: Option<HashSet<OperationType>>,
    filters: Vec<Filter>,
    requested_mode: Option<RetrievalMode>,
}

impl<'a> WatchBuilder<'a> {
    pub(crate) fn new(manager: &'a NotificationManager, collections: Vec<String>) -> Self {
        Self {
            manager,
            collections,
            operations: None,
            filters: Vec::new(),
            requested_mode: None,
        }
    }

    pub fn only_inserts(self) -> Self {
        self.on_operations([OperationType::Insert])
    }

    pub fn only_updates(self) -> Self {
        self.on_operations([OperationType::Update])
    }

    pub fn only_deletes(self) -> Self {
        self.on_operations([OperationType::Delete])
    }

    /// Allow the given operation types. Repeated calls widen the set.
    pub fn on_operations(mut self, ops: impl IntoIterator<Item = OperationType>) -> Self {
        self.operations.get_or_insert_with(HashSet::new).extend(ops);
        self
    }

    /// Only events whose full document has `key == value`.
    pub fn where_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.filters.push(Filter::field_equals(key, value));
        self
    }

    /// Only events whose full document contains `key`.
    pub fn where_field_exists(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.filters
            .push(Filter::predicate(move |event| event.field(&key).is_some()));
        self
    }

    /// Only updates that set `field`.
    pub fn when_field_updated(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.filters.push(Filter::predicate(move |event| {
            event.updated_fields().contains(field.as_str())
        }));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Request a retrieval mode. Delivery still follows the run's mode.
    pub fn with_mode(mut self, mode: RetrievalMode) -> Self {
        self.requested_mode = Some(mode);
        self
    }

    /// Declare the interest, spawning workers if the manager is running.
    ///
    /// Feed filters given here replace the collections' previous ones; with
    /// none given, existing feed filters are kept.
    pub fn start(self) -> Result<()> {
        let mut filters = self.filters;
        if let Some(ops) = self.operations {
            filters.insert(0, Filter::OperationAllowList(ops));
        }
        self.manager
            .declare_interest(&self.collections, filters, self.requested_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::feed::RawRecord;
    use crate::registry::{listener, matches_all};
    use crate::types::{ResumeToken, UpdateDescription};
    use serde_json::json;

    fn update(collection: &str, set: serde_json::Value) -> ChangeEvent {
        let updated_fields = match set {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        let raw = RawRecord {
            operation_type: "update".into(),
            document_key: Some(json!(1)),
            update_description: Some(UpdateDescription {
                updated_fields,
                removed_fields: Vec::new(),
            }),
            resume_token: Some(ResumeToken(vec![2])),
            ..Default::default()
        };
        ChangeEvent::decode(raw, collection, RetrievalMode::Default).unwrap()
    }

    #[test]
    fn test_watch_filters_recorded() {
        let manager = NotificationManager::new(ManagerConfig::default());
        manager
            .watch("users")
            .only_updates()
            .when_field_updated("email")
            .start()
            .unwrap();

        let filters = manager.feed_filters("users");
        assert_eq!(filters.len(), 2);
        assert!(matches_all(&filters, &update("users", json!({"email": "a@b"}))));
        assert!(!matches_all(&filters, &update("users", json!({"name": "x"}))));

        // A watch without filters keeps the existing ones.
        manager.watch("users").start().unwrap();
        assert_eq!(manager.feed_filters("users").len(), 2);

        // One with filters replaces them.
        manager.watch("users").only_inserts().start().unwrap();
        assert_eq!(manager.feed_filters("users").len(), 1);
    }

    #[test]
    fn test_operations_widen() {
        let manager = NotificationManager::new(ManagerConfig::default());
        manager
            .watch("users")
            .only_inserts()
            .only_updates()
            .start()
            .unwrap();

        let filters = manager.feed_filters("users");
        assert!(matches_all(&filters, &update("users", json!({}))));
    }

    #[test]
    fn test_filter_collection() {
        let manager = NotificationManager::new(ManagerConfig::default());
        manager
            .create_listener_builder(listener(|_| Ok(())), Scope::Global)
            .filter_collection(["orders"])
            .register()
            .unwrap();

        assert_eq!(manager.dispatch(&update("users", json!({}))), 0);
        assert_eq!(manager.dispatch(&update("orders", json!({}))), 1);
    }
}
