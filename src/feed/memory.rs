//! In-process document store with per-collection change logs.
//!
//! Implements [`FeedSource`] so the manager can watch it like any external
//! store. Resume tokens are MessagePack-encoded positions followed by a
//! CRC32 of the encoding.

use crate::error::{NotifyError, Result};
use crate::types::{
    Document, DocumentKey, OperationType, ResumeToken, RetrievalMode, Timestamp,
    UpdateDescription,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::source::{FeedError, FeedSession, FeedSource, RawRecord};

/// Current resume token format version.
const TOKEN_VERSION: u8 = 1;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TokenPayload {
    version: u8,
    collection: String,
    /// Index of the first log entry after the named record.
    position: u64,
}

fn encode_token(collection: &str, position: u64) -> Result<ResumeToken> {
    let payload = TokenPayload {
        version: TOKEN_VERSION,
        collection: collection.to_string(),
        position,
    };
    let mut bytes = rmp_serde::to_vec(&payload)?;
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    Ok(ResumeToken(bytes))
}

fn decode_token(token: &ResumeToken) -> Result<TokenPayload> {
    let bytes = token.as_bytes();
    if bytes.len() < 4 {
        return Err(NotifyError::Deserialization("resume token too short".into()));
    }

    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 4);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(checksum_bytes);
    if crc32fast::hash(body) != u32::from_le_bytes(checksum) {
        return Err(NotifyError::Deserialization("resume token checksum mismatch".into()));
    }

    let payload: TokenPayload = rmp_serde::from_slice(body)?;
    if payload.version != TOKEN_VERSION {
        return Err(NotifyError::Deserialization(format!(
            "unsupported resume token version: {}",
            payload.version
        )));
    }
    Ok(payload)
}

/// One entry of a collection's change log.
#[derive(Clone, Debug)]
enum LogEntry {
    Change {
        operation: OperationType,
        key: u64,
        /// Post-image for inserts and replaces.
        document: Option<Document>,
        update: Option<UpdateDescription>,
        cluster_time: Timestamp,
    },
    /// Injected verbatim, possibly malformed.
    Raw(RawRecord),
}

#[derive(Default)]
struct CollectionState {
    documents: BTreeMap<u64, Document>,
    log: Vec<LogEntry>,
    next_key: u64,
    open_failures: VecDeque<FeedError>,
    interruptions: VecDeque<FeedError>,
}

impl CollectionState {
    fn append(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    fn render(&self, position: usize, collection: &str, mode: RetrievalMode) -> Result<RawRecord> {
        let resume_token = encode_token(collection, position as u64 + 1)?;

        match &self.log[position] {
            LogEntry::Raw(raw) => Ok(raw.clone()),
            LogEntry::Change {
                operation,
                key,
                document,
                update,
                cluster_time,
            } => {
                let full_document = match operation {
                    OperationType::Insert | OperationType::Replace => document.clone(),
                    // Looked up at read time: reflects later writes, absent once deleted.
                    OperationType::Update if mode.includes_full_document() => {
                        self.documents.get(key).cloned()
                    }
                    _ => None,
                };

                Ok(RawRecord {
                    operation_type: operation.as_str().to_string(),
                    collection_name: Some(collection.to_string()),
                    document_key: Some(serde_json::Value::from(*key)),
                    full_document: full_document.map(serde_json::Value::Object),
                    update_description: update.clone(),
                    resume_token: Some(resume_token),
                    cluster_time: Some(cluster_time.0),
                })
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    collections: Mutex<HashMap<String, CollectionState>>,
    changed: Condvar,
}

/// In-memory document store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<T>(&self, collection: &str, f: impl FnOnce(&mut CollectionState) -> T) -> T {
        let mut collections = self.inner.collections.lock();
        let state = collections.entry(collection.to_string()).or_default();
        let result = f(state);
        self.inner.changed.notify_all();
        result
    }

    // --- Document Operations ---

    /// Insert a document and return its store-assigned key.
    pub fn insert(&self, collection: &str, document: serde_json::Value) -> Result<DocumentKey> {
        let document = as_document(document)?;
        Ok(self.mutate(collection, |state| {
            state.next_key += 1;
            let key = state.next_key;
            state.documents.insert(key, document.clone());
            state.append(LogEntry::Change {
                operation: OperationType::Insert,
                key,
                document: Some(document),
                update: None,
                cluster_time: Timestamp::now(),
            });
            DocumentKey::from(key)
        }))
    }

    /// Set and remove fields of a document. Returns false if it does not exist.
    pub fn update(
        &self,
        collection: &str,
        key: &DocumentKey,
        set: Document,
        unset: &[&str],
    ) -> Result<bool> {
        let Some(key) = key.as_u64() else {
            return Ok(false);
        };
        Ok(self.mutate(collection, |state| {
            let Some(document) = state.documents.get_mut(&key) else {
                return false;
            };

            for (field, value) in &set {
                document.insert(field.clone(), value.clone());
            }
            let removed_fields: Vec<String> = unset
                .iter()
                .filter(|field| document.remove(**field).is_some())
                .map(|field| field.to_string())
                .collect();

            state.append(LogEntry::Change {
                operation: OperationType::Update,
                key,
                document: None,
                update: Some(UpdateDescription {
                    updated_fields: set,
                    removed_fields,
                }),
                cluster_time: Timestamp::now(),
            });
            true
        }))
    }

    /// Set a single field. Returns false if the document does not exist.
    pub fn set_field(
        &self,
        collection: &str,
        key: &DocumentKey,
        field: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<bool> {
        let mut set = Document::new();
        set.insert(field.to_string(), value.into());
        self.update(collection, key, set, &[])
    }

    /// Replace a whole document. Returns false if it does not exist.
    pub fn replace(
        &self,
        collection: &str,
        key: &DocumentKey,
        document: serde_json::Value,
    ) -> Result<bool> {
        let document = as_document(document)?;
        let Some(key) = key.as_u64() else {
            return Ok(false);
        };
        Ok(self.mutate(collection, |state| {
            if !state.documents.contains_key(&key) {
                return false;
            }
            state.documents.insert(key, document.clone());
            state.append(LogEntry::Change {
                operation: OperationType::Replace,
                key,
                document: Some(document),
                update: None,
                cluster_time: Timestamp::now(),
            });
            true
        }))
    }

    /// Delete a document. Returns false if it does not exist.
    pub fn delete(&self, collection: &str, key: &DocumentKey) -> bool {
        let Some(key) = key.as_u64() else {
            return false;
        };
        self.mutate(collection, |state| {
            if state.documents.remove(&key).is_none() {
                return false;
            }
            state.append(LogEntry::Change {
                operation: OperationType::Delete,
                key,
                document: None,
                update: None,
                cluster_time: Timestamp::now(),
            });
            true
        })
    }

    /// Current version of a document.
    pub fn get(&self, collection: &str, key: &DocumentKey) -> Option<Document> {
        let key = key.as_u64()?;
        self.inner
            .collections
            .lock()
            .get(collection)
            .and_then(|state| state.documents.get(&key).cloned())
    }

    /// Number of live documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .collections
            .lock()
            .get(collection)
            .map_or(0, |state| state.documents.len())
    }

    /// Number of change records ever written to a collection.
    pub fn log_len(&self, collection: &str) -> usize {
        self.inner
            .collections
            .lock()
            .get(collection)
            .map_or(0, |state| state.log.len())
    }

    // --- Fault Injection ---

    /// Make the next `open_change_feed` on `collection` fail with `error`.
    pub fn fail_next_open(&self, collection: &str, error: FeedError) {
        self.mutate(collection, |state| state.open_failures.push_back(error));
    }

    /// End the open session on `collection` with `error` at its next poll.
    pub fn interrupt_sessions(&self, collection: &str, error: FeedError) {
        self.mutate(collection, |state| state.interruptions.push_back(error));
    }

    /// Append a record verbatim to the change log of `collection`.
    pub fn push_raw(&self, collection: &str, record: RawRecord) {
        self.mutate(collection, |state| state.append(LogEntry::Raw(record)));
    }
}

fn as_document(value: serde_json::Value) -> Result<Document> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(NotifyError::InvalidDocument(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl FeedSource for MemoryStore {
    fn open_change_feed(
        &self,
        collection: &str,
        mode: RetrievalMode,
        resume_after: Option<&ResumeToken>,
    ) -> std::result::Result<Box<dyn FeedSession>, FeedError> {
        let mut collections = self.inner.collections.lock();
        let state = collections.entry(collection.to_string()).or_default();

        if let Some(error) = state.open_failures.pop_front() {
            return Err(error);
        }

        let position = match resume_after {
            None => state.log.len(),
            Some(token) => {
                let payload = decode_token(token)
                    .map_err(|e| FeedError::InvalidResumeToken(e.to_string()))?;
                if payload.collection != collection {
                    return Err(FeedError::InvalidResumeToken(format!(
                        "token belongs to collection '{}'",
                        payload.collection
                    )));
                }
                if payload.position as usize > state.log.len() {
                    return Err(FeedError::InvalidResumeToken(format!(
                        "position {} is past the end of the log",
                        payload.position
                    )));
                }
                payload.position as usize
            }
        };

        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            collection: collection.to_string(),
            mode,
            position,
        }))
    }
}

/// Cursor over one collection's change log.
struct MemorySession {
    inner: Arc<Inner>,
    collection: String,
    mode: RetrievalMode,
    position: usize,
}

impl FeedSession for MemorySession {
    fn next_record(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<Option<RawRecord>, FeedError> {
        let deadline = Instant::now() + timeout;
        let mut collections = self.inner.collections.lock();

        loop {
            let state = collections.entry(self.collection.clone()).or_default();

            if let Some(error) = state.interruptions.pop_front() {
                return Err(error);
            }

            if self.position < state.log.len() {
                let record = state
                    .render(self.position, &self.collection, self.mode)
                    .map_err(|e| FeedError::Fatal(e.to_string()))?;
                self.position += 1;
                return Ok(Some(record));
            }

            if self.inner.changed.wait_until(&mut collections, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}
