//! Change events delivered to listeners.

use crate::error::{NotifyError, Result};
use crate::feed::RawRecord;
use crate::types::{
    Document, DocumentKey, OperationType, ResumeToken, RetrievalMode, Timestamp,
    UpdateDescription,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Immutable record of one storage change.
///
/// A full document is attached to every insert, and to updates and replaces
/// only when the run's retrieval mode asks for it. An update description is
/// attached to updates only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeEvent {
    operation_type: OperationType,
    collection_name: String,
    document_key: DocumentKey,
    full_document: Option<Document>,
    update_description: Option<UpdateDescription>,
    resume_token: ResumeToken,
    timestamp: Timestamp,
}

impl ChangeEvent {
    /// Validate a raw record read from the feed of `collection`.
    pub fn decode(raw: RawRecord, collection: &str, mode: RetrievalMode) -> Result<Self> {
        let operation_type: OperationType =
            raw.operation_type.parse().map_err(NotifyError::Decode)?;

        let collection_name = match raw.collection_name {
            Some(name) if name != collection => {
                return Err(NotifyError::Decode(format!(
                    "record for collection '{}' on the feed of '{}'",
                    name, collection
                )));
            }
            _ => collection.to_string(),
        };

        let document_key = match raw.document_key {
            Some(serde_json::Value::Null) | None => {
                return Err(NotifyError::Decode("missing document key".into()));
            }
            Some(key) => DocumentKey(key),
        };

        let resume_token = raw
            .resume_token
            .ok_or_else(|| NotifyError::Decode("missing resume token".into()))?;

        let document = match raw.full_document {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(NotifyError::Decode(format!(
                    "full document is not an object: {}",
                    other
                )));
            }
        };

        let full_document = match operation_type {
            OperationType::Insert => Some(document.ok_or_else(|| {
                NotifyError::Decode("insert record without a document".into())
            })?),
            OperationType::Update | OperationType::Replace => {
                if mode.includes_full_document() {
                    document
                } else {
                    None
                }
            }
            OperationType::Delete => None,
        };

        let update_description = match operation_type {
            OperationType::Update => Some(raw.update_description.ok_or_else(|| {
                NotifyError::Decode("update record without an update description".into())
            })?),
            _ => None,
        };

        Ok(Self {
            operation_type,
            collection_name,
            document_key,
            full_document,
            update_description,
            resume_token,
            timestamp: raw.cluster_time.map(Timestamp).unwrap_or_else(Timestamp::now),
        })
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn document_key(&self) -> &DocumentKey {
        &self.document_key
    }

    /// Deserialize the document key into a caller-chosen type.
    pub fn document_key_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.document_key.0.clone())
            .map_err(|e| NotifyError::Deserialization(e.to_string()))
    }

    pub fn full_document(&self) -> Option<&Document> {
        self.full_document.as_ref()
    }

    pub fn update_description(&self) -> Option<&UpdateDescription> {
        self.update_description.as_ref()
    }

    pub fn resume_token(&self) -> &ResumeToken {
        &self.resume_token
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_insert(&self) -> bool {
        self.operation_type == OperationType::Insert
    }

    pub fn is_update(&self) -> bool {
        self.operation_type == OperationType::Update
    }

    pub fn is_delete(&self) -> bool {
        self.operation_type == OperationType::Delete
    }

    pub fn is_replace(&self) -> bool {
        self.operation_type == OperationType::Replace
    }

    pub fn has_full_document(&self) -> bool {
        self.full_document.is_some()
    }

    /// Names of the fields an update set. Empty for any other operation.
    pub fn updated_fields(&self) -> BTreeSet<&str> {
        match (&self.update_description, self.is_update()) {
            (Some(desc), true) => desc.updated_fields.keys().map(String::as_str).collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Names of the fields an update removed. Empty for any other operation.
    pub fn removed_fields(&self) -> BTreeSet<&str> {
        match (&self.update_description, self.is_update()) {
            (Some(desc), true) => desc.removed_fields.iter().map(String::as_str).collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Look up a top-level field of the full document.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.full_document.as_ref().and_then(|doc| doc.get(name))
    }

    /// The full document as JSON text, if one is attached.
    pub fn to_json(&self) -> Option<String> {
        self.full_document
            .as_ref()
            .and_then(|doc| serde_json::to_string(doc).ok())
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChangeEvent{{operation={}, collection={}, key={}, has_full_document={}}}",
            self.operation_type,
            self.collection_name,
            self.document_key,
            self.has_full_document()
        )
    }
}
