//! Storage Module Tests
//!
//! Validates the engine's apply/replay semantics and snapshot persistence.
//!
//! ## Test Scopes
//! - **Apply**: last-writer state per key, tombstones, idempotency per sequence.
//! - **Replay**: interrupted and resumed replay converges on the same state.
//! - **Snapshots**: restore + tail replay equals full replay.

#[cfg(test)]
mod tests {
    use crate::storage::engine::StorageEngine;
    use crate::storage::snapshot::{SNAPSHOT_FILE, load_snapshot, write_snapshot};
    use crate::wal::log::WriteAheadLog;
    use crate::wal::types::{NewEntry, RecordValue, SyncPolicy, WalEntry};
    use tempfile::tempdir;

    fn value(field: &str, data: &str) -> RecordValue {
        let mut map = RecordValue::new();
        map.insert(field.to_string(), serde_json::Value::String(data.to_string()));
        map
    }

    fn put(seq: u64, key: &str, data: &str, version: u64) -> WalEntry {
        NewEntry::put("usertable", key, value("f", data), version).with_sequence(seq)
    }

    fn delete(seq: u64, key: &str, version: u64) -> WalEntry {
        NewEntry::delete("usertable", key, version).with_sequence(seq)
    }

    // ============================================================
    // APPLY
    // ============================================================

    #[test]
    fn test_final_value_is_last_put() {
        let engine = StorageEngine::new();

        engine.apply(&put(1, "u1", "a", 1));
        engine.apply(&put(2, "u1", "b", 2));
        engine.apply(&put(3, "u1", "c", 3));

        let record = engine.get("usertable", "u1").expect("record exists");
        assert_eq!(record.value, value("f", "c"));
        assert_eq!(record.version, 3);
        assert_eq!(engine.last_applied_sequence(), 3);
    }

    #[test]
    fn test_delete_leaves_versioned_tombstone() {
        let engine = StorageEngine::new();

        engine.apply(&put(1, "u1", "a", 1));
        engine.apply(&delete(2, "u1", 2));

        assert!(engine.get("usertable", "u1").is_none());

        let stored = engine.get_stored("usertable", "u1").expect("tombstone kept");
        assert!(stored.is_tombstone());
        assert_eq!(stored.version, 2);
        assert_eq!(engine.current_version("usertable", "u1"), 2);

        // A later put keeps counting upward from the tombstone.
        engine.apply(&put(3, "u1", "z", 3));
        assert_eq!(engine.get("usertable", "u1").unwrap().version, 3);
    }

    #[test]
    fn test_apply_same_sequence_twice_is_noop() {
        let engine = StorageEngine::new();
        let entry = put(1, "u1", "a", 1);

        assert!(engine.apply(&entry));
        assert!(!engine.apply(&entry));

        // An older sequence for the same key must not roll the value back.
        engine.apply(&put(2, "u1", "b", 2));
        assert!(!engine.apply(&entry));
        assert_eq!(engine.get("usertable", "u1").unwrap().value, value("f", "b"));
    }

    #[test]
    fn test_missing_key_and_table() {
        let engine = StorageEngine::new();
        assert!(engine.get("usertable", "nope").is_none());
        assert!(engine.get("other", "nope").is_none());
        assert_eq!(engine.current_version("usertable", "nope"), 0);
    }

    #[test]
    fn test_tables_are_isolated() {
        let engine = StorageEngine::new();
        engine.apply(&put(1, "k", "users", 1));
        engine.apply(&NewEntry::put("orders", "k", value("f", "orders"), 1).with_sequence(2));

        assert_eq!(engine.get("usertable", "k").unwrap().value, value("f", "users"));
        assert_eq!(engine.get("orders", "k").unwrap().value, value("f", "orders"));
        assert_eq!(engine.live_count(), 2);
        assert_eq!(
            engine.live_keys(),
            vec![
                ("orders".to_string(), "k".to_string()),
                ("usertable".to_string(), "k".to_string())
            ]
        );
    }

    // ============================================================
    // REPLAY
    // ============================================================

    fn history() -> Vec<WalEntry> {
        vec![
            put(1, "a", "1", 1),
            put(2, "b", "1", 1),
            put(3, "a", "2", 2),
            delete(4, "b", 2),
            put(5, "c", "1", 1),
            put(6, "b", "3", 3),
            delete(7, "c", 2),
        ]
    }

    #[test]
    fn test_interrupted_replay_converges() {
        let full = StorageEngine::new();
        full.replay(history().into_iter().map(Ok)).unwrap();

        // Replay a prefix, then restart from the beginning twice.
        let resumed = StorageEngine::new();
        resumed.replay(history().into_iter().take(3).map(Ok)).unwrap();
        resumed.replay(history().into_iter().take(5).map(Ok)).unwrap();
        let applied = resumed.replay(history().into_iter().map(Ok)).unwrap();

        assert_eq!(applied, 2);
        assert_eq!(resumed.snapshot(), full.snapshot());
    }

    #[test]
    fn test_replay_from_wal_file() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Never).unwrap();
        wal.append(NewEntry::put("usertable", "u1", value("f", "a"), 1)).unwrap();
        wal.append(NewEntry::put("usertable", "u1", value("f", "b"), 2)).unwrap();
        wal.append(NewEntry::delete("usertable", "u1", 3)).unwrap();
        wal.append(NewEntry::put("usertable", "u2", value("f", "x"), 1)).unwrap();

        let engine = StorageEngine::new();
        engine.replay(wal.read_from(1).unwrap()).unwrap();

        assert!(engine.get("usertable", "u1").is_none());
        assert_eq!(engine.get("usertable", "u2").unwrap().version, 1);
        assert_eq!(engine.last_applied_sequence(), 4);
    }

    // ============================================================
    // SNAPSHOTS
    // ============================================================

    #[test]
    fn test_snapshot_then_tail_equals_full_replay() {
        let dir = tempdir().expect("temp dir");
        let entries = history();

        let partial = StorageEngine::new();
        partial.replay(entries.iter().take(4).cloned().map(Ok)).unwrap();
        write_snapshot(dir.path(), &partial.snapshot()).unwrap();

        let snapshot = load_snapshot(dir.path()).unwrap().expect("snapshot exists");
        assert_eq!(snapshot.last_applied_sequence, 4);

        let restored = StorageEngine::from_snapshot(snapshot);
        restored
            .replay(entries.iter().skip(4).cloned().map(Ok))
            .unwrap();

        let full = StorageEngine::new();
        full.replay(entries.into_iter().map(Ok)).unwrap();

        assert_eq!(restored.snapshot(), full.snapshot());
    }

    #[test]
    fn test_missing_or_corrupt_snapshot_is_ignored() {
        let dir = tempdir().expect("temp dir");
        assert!(load_snapshot(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"{not json").unwrap();
        assert!(load_snapshot(dir.path()).unwrap().is_none());
    }
}
