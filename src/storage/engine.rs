use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{Record, Snapshot, StoredRecord};
use crate::wal::types::{WalEntry, WalError, WalOp};

pub struct StorageEngine {
    /// Structure: `table -> storage key -> record`.
    tables: DashMap<String, DashMap<String, StoredRecord>>,
    last_applied: AtomicU64,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let tables = DashMap::new();
        for (table, records) in snapshot.tables {
            let table_map: DashMap<String, StoredRecord> = records.into_iter().collect();
            tables.insert(table, table_map);
        }

        Self {
            tables,
            last_applied: AtomicU64::new(snapshot.last_applied_sequence),
        }
    }

    /// Applies one WAL entry. Returns `false` when the key already reflects this
    /// sequence or a later one, in which case nothing changes.
    pub fn apply(&self, entry: &WalEntry) -> bool {
        let table = self
            .tables
            .entry(entry.table.clone())
            .or_insert_with(DashMap::new);

        let next = StoredRecord {
            value: match entry.op {
                WalOp::Put => Some(entry.value.clone().unwrap_or_default()),
                WalOp::Delete => None,
            },
            version: entry.version,
            sequence: entry.sequence,
        };

        match table.entry(entry.key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().sequence >= entry.sequence {
                    tracing::debug!(
                        "Skipping already applied sequence {} for {}/{}",
                        entry.sequence,
                        entry.table,
                        entry.key
                    );
                    return false;
                }
                existing.insert(next);
            }
            Entry::Vacant(slot) => {
                slot.insert(next);
            }
        }

        self.last_applied.fetch_max(entry.sequence, Ordering::SeqCst);
        true
    }

    /// Applies entries in order, stopping at the first read error.
    /// Returns how many entries changed state.
    pub fn replay<I>(&self, entries: I) -> Result<u64, WalError>
    where
        I: IntoIterator<Item = Result<WalEntry, WalError>>,
    {
        let mut applied = 0;
        for entry in entries {
            if self.apply(&entry?) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Live record for the key, or `None` if absent or deleted.
    pub fn get(&self, table: &str, key: &str) -> Option<Record> {
        let stored = self.get_stored(table, key)?;
        let value = stored.value?;
        Some(Record {
            table: table.to_string(),
            key: key.to_string(),
            value,
            version: stored.version,
        })
    }

    /// Record including tombstones.
    pub fn get_stored(&self, table: &str, key: &str) -> Option<StoredRecord> {
        let table_map = self.tables.get(table)?;
        let stored = table_map.get(key)?;
        Some(stored.clone())
    }

    /// Version the key currently has (tombstones included); 0 if never written.
    pub fn current_version(&self, table: &str, key: &str) -> u64 {
        self.get_stored(table, key)
            .map(|stored| stored.version)
            .unwrap_or(0)
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// `(table, key)` for every live record, sorted.
    pub fn live_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .tables
            .iter()
            .flat_map(|table| {
                let name = table.key().clone();
                table
                    .value()
                    .iter()
                    .filter(|record| !record.value().is_tombstone())
                    .map(|record| (name.clone(), record.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn live_count(&self) -> usize {
        self.tables
            .iter()
            .map(|table| {
                table
                    .value()
                    .iter()
                    .filter(|record| !record.value().is_tombstone())
                    .count()
            })
            .sum()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut tables = BTreeMap::new();
        for table in self.tables.iter() {
            let records: BTreeMap<String, StoredRecord> = table
                .value()
                .iter()
                .map(|record| (record.key().clone(), record.value().clone()))
                .collect();
            tables.insert(table.key().clone(), records);
        }

        Snapshot {
            last_applied_sequence: self.last_applied_sequence(),
            tables,
        }
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}
