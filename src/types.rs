//! Core value types shared by the feed, registry and manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ordered mapping of field name to value.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Kind of storage change carried by a change record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Replace,
}

impl OperationType {
    /// All operation types, in declaration order.
    pub const ALL: [OperationType; 4] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Delete,
        OperationType::Replace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationType::Insert),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "replace" => Ok(OperationType::Replace),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// Whether update records carry the complete current document.
///
/// One mode is active per manager run; every feed session of that run is
/// opened with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Updates carry only the delta (updated and removed field names).
    Default,
    /// Updates also carry the document as looked up when the record is read.
    UpdateLookup,
}

impl RetrievalMode {
    /// Whether update and replace records should carry a full document.
    pub fn includes_full_document(&self) -> bool {
        matches!(self, RetrievalMode::UpdateLookup)
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMode::Default => f.write_str("default"),
            RetrievalMode::UpdateLookup => f.write_str("update_lookup"),
        }
    }
}

/// Store-assigned identifier of a document.
///
/// Opaque to the core and distinct from any domain id the document may carry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(pub serde_json::Value);

impl DocumentKey {
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.0.as_u64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentKey({})", self.0)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DocumentKey {
    fn from(v: u64) -> Self {
        DocumentKey(serde_json::Value::from(v))
    }
}

impl From<&str> for DocumentKey {
    fn from(v: &str) -> Self {
        DocumentKey(serde_json::Value::from(v))
    }
}

impl From<String> for DocumentKey {
    fn from(v: String) -> Self {
        DocumentKey(serde_json::Value::from(v))
    }
}

/// Opaque position marker in a change feed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub Vec<u8>);

impl ResumeToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(ResumeToken(hex::decode(s)?))
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if hex.len() > 16 {
            write!(f, "ResumeToken({}...)", &hex[..16])
        } else {
            write!(f, "ResumeToken({})", hex)
        }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Delta carried by an update record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Updated fields with their new values.
    #[serde(default)]
    pub updated_fields: Document,

    /// Names of fields removed from the document.
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}
