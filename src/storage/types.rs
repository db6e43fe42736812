use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::wal::types::RecordValue;

/// A live record as returned to readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub table: String,
    pub key: String,
    pub value: RecordValue,
    pub version: u64,
}

/// What the engine keeps per key. `value == None` marks a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RecordValue>,
    pub version: u64,
    /// WAL sequence that produced this state.
    pub sequence: u64,
}

impl StoredRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Point-in-time copy of the engine, ordered so equal states compare equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub last_applied_sequence: u64,
    pub tables: BTreeMap<String, BTreeMap<String, StoredRecord>>,
}
