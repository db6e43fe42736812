//! WAL Module Tests
//!
//! ## Test Scopes
//! - **Sequencing**: gapless numbering starting at 1, preserved across reopen.
//! - **Torn writes**: truncated or corrupted tails are cut off on reopen.
//! - **Failed appends**: nothing is published, and an unrepairable tail stops the writer.
//! - **Readers**: snapshot iterators and live cursors.

#[cfg(test)]
mod tests {
    use crate::wal::log::{WAL_LOG_FILE, WriteAheadLog};
    use crate::wal::types::{NewEntry, RecordValue, SyncPolicy, WalError, WalOp};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn value(field: &str, data: &str) -> RecordValue {
        let mut map = RecordValue::new();
        map.insert(field.to_string(), serde_json::Value::String(data.to_string()));
        map
    }

    fn put(key: &str, version: u64) -> NewEntry {
        NewEntry::put("usertable", key, value("f", key), version)
    }

    // ============================================================
    // SEQUENCING
    // ============================================================

    #[test]
    fn test_append_assigns_gapless_sequences() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("open");

        assert_eq!(wal.last_sequence(), 0);

        for i in 1..=5 {
            let entry = wal.append(put(&format!("k{}", i), 1)).expect("append");
            assert_eq!(entry.sequence, i);
        }

        assert_eq!(wal.last_sequence(), 5);
    }

    #[test]
    fn test_reopen_resumes_after_last_entry() {
        let dir = tempdir().expect("temp dir");
        {
            let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("open");
            wal.append(put("a", 1)).unwrap();
            wal.append(put("b", 1)).unwrap();
            wal.append(NewEntry::delete("usertable", "a", 2)).unwrap();
        }

        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("reopen");
        assert_eq!(wal.last_sequence(), 3);

        let entries: Vec<_> = wal.read_from(1).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].op, WalOp::Delete);
        assert!(entries[2].value.is_none());

        let next = wal.append(put("c", 1)).unwrap();
        assert_eq!(next.sequence, 4);
    }

    #[test]
    fn test_append_replicated_rejects_gaps_and_duplicates() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Never).expect("open");

        let first = put("a", 1).with_sequence(1);
        wal.append_replicated(&first).expect("first entry");

        let gap = put("b", 1).with_sequence(3);
        match wal.append_replicated(&gap) {
            Err(WalError::OutOfOrder { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected OutOfOrder, got {:?}", other),
        }

        assert!(wal.append_replicated(&first).is_err());
        assert_eq!(wal.last_sequence(), 1);
    }

    // ============================================================
    // TORN WRITES
    // ============================================================

    #[test]
    fn test_truncated_tail_is_discarded_on_reopen() {
        let dir = tempdir().expect("temp dir");
        {
            let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("open");
            for i in 1..=3 {
                wal.append(put(&format!("k{}", i), 1)).unwrap();
            }
        }

        // Simulate a crash in the middle of writing entry 4.
        let path = dir.path().join(WAL_LOG_FILE);
        let full_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0, 0, 0, 42, 1, 2]).unwrap();
        }

        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("reopen");
        assert_eq!(wal.last_sequence(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full_len);

        let entry = wal.append(put("k4", 1)).unwrap();
        assert_eq!(entry.sequence, 4);
        let all: Vec<_> = wal.read_from(1).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_checksum_mismatch_ends_valid_prefix() {
        let dir = tempdir().expect("temp dir");
        {
            let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("open");
            wal.append(put("a", 1)).unwrap();
            wal.append(put("b", 1)).unwrap();
        }

        // Flip the last payload byte of the second frame.
        let path = dir.path().join(WAL_LOG_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Always).expect("reopen");
        assert_eq!(wal.last_sequence(), 1);
        let entries: Vec<_> = wal.read_from(1).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "a");
    }

    // ============================================================
    // FAILED APPENDS
    // ============================================================

    /// A WAL whose log file is `/dev/full`: every write fails with ENOSPC and
    /// the device cannot be truncated.
    #[cfg(target_os = "linux")]
    fn full_disk_wal(dir: &std::path::Path) -> WriteAheadLog {
        std::os::unix::fs::symlink("/dev/full", dir.join(WAL_LOG_FILE)).expect("symlink");
        WriteAheadLog::open(dir, SyncPolicy::Always).expect("open")
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_does_not_advance_sequence() {
        let dir = tempdir().expect("temp dir");
        let wal = full_disk_wal(dir.path());
        let mut tip = wal.subscribe();

        assert!(wal.append(put("a", 1)).is_err());
        assert_eq!(wal.last_sequence(), 0);
        assert!(!tip.has_changed().unwrap());
        assert!(wal.read_batch(1, 10).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unrecoverable_partial_frame_stops_later_appends() {
        let dir = tempdir().expect("temp dir");
        let wal = full_disk_wal(dir.path());

        // The write fails and so does the rollback.
        assert!(matches!(wal.append(put("a", 1)), Err(WalError::Io(_))));

        assert!(matches!(wal.append(put("b", 1)), Err(WalError::Failed)));
        let copied = NewEntry::put("usertable", "c", value("f", "c"), 1).with_sequence(1);
        assert!(matches!(
            wal.append_replicated(&copied),
            Err(WalError::Failed)
        ));
        assert_eq!(wal.last_sequence(), 0);
    }

    // ============================================================
    // READERS
    // ============================================================

    #[test]
    fn test_read_from_middle_and_past_end() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Never).expect("open");
        for i in 1..=10 {
            wal.append(put(&format!("k{}", i), 1)).unwrap();
        }

        let tail: Vec<u64> = wal
            .read_from(7)
            .unwrap()
            .map(|e| e.unwrap().sequence)
            .collect();
        assert_eq!(tail, vec![7, 8, 9, 10]);

        assert_eq!(wal.read_from(11).unwrap().count(), 0);
        assert_eq!(wal.read_batch(2, 3).unwrap().len(), 3);

        // Sequence 0 is treated as "from the beginning".
        assert_eq!(wal.read_from(0).unwrap().count(), 10);
    }

    #[test]
    fn test_reader_is_restartable() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Never).expect("open");
        for i in 1..=4 {
            wal.append(put(&format!("k{}", i), 1)).unwrap();
        }

        let first: Vec<_> = wal.read_from(1).unwrap().take(2).map(|e| e.unwrap()).collect();
        let resumed: Vec<_> = wal.read_from(3).unwrap().map(|e| e.unwrap()).collect();

        assert_eq!(first.last().unwrap().sequence, 2);
        assert_eq!(resumed.first().unwrap().sequence, 3);
        assert_eq!(resumed.len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_waits_for_new_entries() {
        let dir = tempdir().expect("temp dir");
        let wal = Arc::new(WriteAheadLog::open(dir.path(), SyncPolicy::Never).expect("open"));
        wal.append(put("a", 1)).unwrap();

        let writer = wal.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(put("b", 1)).unwrap();
        });

        let mut cursor = wal.cursor(1);
        let first = cursor.next().await.unwrap();
        assert_eq!(first.sequence, 1);

        let second = tokio::time::timeout(Duration::from_secs(2), cursor.next())
            .await
            .expect("cursor should wake on append")
            .unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(cursor.position(), 3);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_seek_rewinds() {
        let dir = tempdir().expect("temp dir");
        let wal = WriteAheadLog::open(dir.path(), SyncPolicy::Never).expect("open");
        for i in 1..=3 {
            wal.append(put(&format!("k{}", i), 1)).unwrap();
        }

        let mut cursor = wal.cursor(1);
        let batch = cursor.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 3);

        cursor.seek(2);
        let again = cursor.next_batch(10).await.unwrap();
        assert_eq!(again.first().unwrap().sequence, 2);
        assert_eq!(again.len(), 2);
    }
}
