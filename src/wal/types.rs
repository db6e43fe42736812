use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Value stored under a key: a JSON object (field name -> field value).
pub type RecordValue = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WalOp {
    Put,
    Delete,
}

/// An entry before the log has assigned its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub op: WalOp,
    pub table: String,
    pub key: String,
    pub value: Option<RecordValue>,
    pub version: u64,
}

impl NewEntry {
    pub fn put(table: &str, key: &str, value: RecordValue, version: u64) -> Self {
        Self {
            op: WalOp::Put,
            table: table.to_string(),
            key: key.to_string(),
            value: Some(value),
            version,
        }
    }

    pub fn delete(table: &str, key: &str, version: u64) -> Self {
        Self {
            op: WalOp::Delete,
            table: table.to_string(),
            key: key.to_string(),
            value: None,
            version,
        }
    }

    pub fn with_sequence(self, sequence: u64) -> WalEntry {
        WalEntry {
            sequence,
            op: self.op,
            table: self.table,
            key: self.key,
            value: self.value,
            version: self.version,
        }
    }
}

/// A durable log record. Immutable once appended.
///
/// `version` is the version the key has after this entry is applied; a
/// `Delete` entry carries the tombstone's version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub sequence: u64,
    pub op: WalOp,
    pub table: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RecordValue>,
    pub version: u64,
}

/// Whether each append is followed by `sync_data` before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Always,
    Never,
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" | "true" | "1" => Ok(SyncPolicy::Always),
            "never" | "false" | "0" => Ok(SyncPolicy::Never),
            other => Err(format!("unknown fsync policy '{}'", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal encode error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("out of order append: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("wal corrupted at sequence {sequence}: {reason}")]
    Corrupted { sequence: u64, reason: &'static str },

    #[error("wal writer lock poisoned")]
    Poisoned,

    #[error("wal unusable: a partial frame could not be rolled back")]
    Failed,

    #[error("wal closed")]
    Closed,
}
