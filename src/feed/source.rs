//! Contract between the feed workers and the document store.

use crate::types::{ResumeToken, RetrievalMode, UpdateDescription};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a feed source or an open session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FeedError {
    /// The session could not be opened or was interrupted; retrying may help.
    #[error("transient feed failure: {0}")]
    Transient(String),

    /// The store no longer recognises the resume position.
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// The feed cannot continue (collection dropped, permissions revoked, ...).
    #[error("fatal feed failure: {0}")]
    Fatal(String),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Fatal(_))
    }
}

/// One change record as produced by the store, before validation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Lowercase operation name ("insert", "update", "delete", "replace").
    #[serde(alias = "operationType")]
    pub operation_type: String,

    #[serde(default, alias = "collectionName")]
    pub collection_name: Option<String>,

    #[serde(default, alias = "documentKey")]
    pub document_key: Option<serde_json::Value>,

    #[serde(default, alias = "fullDocument")]
    pub full_document: Option<serde_json::Value>,

    #[serde(default, alias = "updateDescription")]
    pub update_description: Option<UpdateDescription>,

    #[serde(default, alias = "resumeToken")]
    pub resume_token: Option<ResumeToken>,

    /// Commit time in microseconds since Unix epoch, when the store reports it.
    #[serde(default, alias = "clusterTime")]
    pub cluster_time: Option<i64>,
}

/// An open, resumable change feed on one collection.
pub trait FeedSession: Send {
    /// Wait up to `timeout` for the next record.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Any `Err` ends the
    /// session.
    fn next_record(&mut self, timeout: Duration) -> Result<Option<RawRecord>, FeedError>;
}

/// A document store able to open change feeds.
pub trait FeedSource: Send + Sync {
    /// Open a change feed on `collection`.
    ///
    /// Without `resume_after` the feed starts at the current end of the
    /// collection's history; with it, right after the named record.
    fn open_change_feed(
        &self,
        collection: &str,
        mode: RetrievalMode,
        resume_after: Option<&ResumeToken>,
    ) -> Result<Box<dyn FeedSession>, FeedError>;
}
