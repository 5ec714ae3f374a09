//! Error types for the notification core.

use crate::feed::FeedError;
use crate::types::RetrievalMode;
use thiserror::Error;

/// Main error type for manager, registry and decode operations.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification manager is already running")]
    AlreadyRunning,

    #[error("Requested retrieval mode {requested} conflicts with active mode {active}")]
    ModeConflict {
        requested: RetrievalMode,
        active: RetrievalMode,
    },

    #[error("Cannot open change feed: {0}")]
    Connect(String),

    #[error("Malformed change record: {0}")]
    Decode(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Listener failed: {0}")]
    Listener(String),

    #[error("Change feed error: {0}")]
    Feed(FeedError),

    #[error("Failed to spawn feed worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<FeedError> for NotifyError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Transient(msg) => NotifyError::Connect(msg),
            other => NotifyError::Feed(other),
        }
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(e: serde_json::Error) -> Self {
        NotifyError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for NotifyError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NotifyError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NotifyError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NotifyError::Deserialization(e.to_string())
    }
}

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
