//! Snapshot persistence.
//!
//! A snapshot is an optimisation only: the WAL stays the source of truth and is
//! never rewritten. A snapshot that cannot be read is ignored and recovery falls
//! back to a full replay.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::types::Snapshot;

pub const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";

/// Writes the snapshot atomically (temp file, fsync, rename).
pub fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(SNAPSHOT_TMP_FILE);
    let bytes = serde_json::to_vec(snapshot).map_err(io::Error::other)?;

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;

    tracing::debug!(
        "Wrote snapshot at sequence {}",
        snapshot.last_applied_sequence
    );
    Ok(())
}

pub fn load_snapshot(dir: &Path) -> io::Result<Option<Snapshot>> {
    let bytes = match fs::read(dir.join(SNAPSHOT_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<Snapshot>(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            tracing::warn!("Ignoring unreadable snapshot: {}", e);
            Ok(None)
        }
    }
}
