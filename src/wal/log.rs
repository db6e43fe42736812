//! File-backed write-ahead log.
//!
//! Record layout: `[u32 BE payload len][u32 BE crc32(payload)][payload]`, where the
//! payload is a JSON-encoded [`WalEntry`]. The log is only ever appended to; the
//! one exception is cutting off an invalid tail, either found on open or left by
//! a failed append.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crc32fast::Hasher;
use tokio::sync::watch;

use super::types::{NewEntry, SyncPolicy, WalEntry, WalError};

/// File name used for the log within the shard's data directory.
pub const WAL_LOG_FILE: &str = "wal.log";

const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Default batch size for live cursors.
pub const CURSOR_BATCH: usize = 256;

struct WalWriter {
    file: File,
    /// `offsets[i]` is the byte offset of the frame holding sequence `i + 1`.
    offsets: Vec<u64>,
    end: u64,
    /// Set when a partial frame could not be cut off; every later append fails.
    failed: bool,
}

pub struct WriteAheadLog {
    path: PathBuf,
    sync: SyncPolicy,
    writer: Mutex<WalWriter>,
    /// Highest durable sequence (0 when empty).
    tip: watch::Sender<u64>,
}

impl WriteAheadLog {
    /// Opens (or creates) the log in `dir`, verifying every frame.
    ///
    /// Frames after the first short, corrupt, undecodable or out-of-sequence frame
    /// are discarded and the file is truncated to the verified prefix.
    pub fn open(dir: impl AsRef<Path>, sync: SyncPolicy) -> Result<Self, WalError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_LOG_FILE);

        let scan = scan_log(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let on_disk = file.metadata()?.len();
        if on_disk > scan.valid_len {
            tracing::warn!(
                "Discarding {} trailing WAL bytes after sequence {} ({})",
                on_disk - scan.valid_len,
                scan.offsets.len(),
                scan.stop_reason.unwrap_or("unknown")
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let last = scan.offsets.len() as u64;
        tracing::info!("Opened WAL at {:?} (last sequence {})", path, last);

        let (tip, _) = watch::channel(last);

        Ok(Self {
            path,
            sync,
            writer: Mutex::new(WalWriter {
                file,
                offsets: scan.offsets,
                end: scan.valid_len,
                failed: false,
            }),
            tip,
        })
    }

    /// Highest durable sequence number; 0 for an empty log.
    pub fn last_sequence(&self) -> u64 {
        *self.tip.borrow()
    }

    /// Receiver that observes the durable tip as it advances.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }

    /// Assigns the next sequence, persists the entry, and only then publishes it.
    ///
    /// On failure nothing is published and the sequence counter does not move.
    pub fn append(&self, entry: NewEntry) -> Result<WalEntry, WalError> {
        let mut writer = self.lock_writer()?;
        let sequence = writer.offsets.len() as u64 + 1;
        let entry = entry.with_sequence(sequence);
        self.write_locked(&mut writer, &entry)?;
        Ok(entry)
    }

    /// Appends an entry that already carries a sequence (a follower copying its
    /// leader's log). The sequence must be exactly one past the local tip.
    pub fn append_replicated(&self, entry: &WalEntry) -> Result<(), WalError> {
        let mut writer = self.lock_writer()?;
        let expected = writer.offsets.len() as u64 + 1;
        if entry.sequence != expected {
            return Err(WalError::OutOfOrder {
                expected,
                got: entry.sequence,
            });
        }
        self.write_locked(&mut writer, entry)
    }

    fn write_locked(&self, writer: &mut WalWriter, entry: &WalEntry) -> Result<(), WalError> {
        if writer.failed {
            return Err(WalError::Failed);
        }
        let frame = encode_frame(entry)?;
        let start = writer.end;

        let result = writer.file.write_all(&frame).and_then(|_| match self.sync {
            SyncPolicy::Always => writer.file.sync_data(),
            SyncPolicy::Never => Ok(()),
        });

        if let Err(e) = result {
            // Cut off whatever part of the frame made it to disk.
            if let Err(truncate_err) = writer.file.set_len(start) {
                tracing::error!(
                    "Failed to roll back partial WAL frame at offset {}, refusing further appends: {}",
                    start,
                    truncate_err
                );
                writer.failed = true;
            }
            return Err(WalError::Io(e));
        }

        writer.offsets.push(start);
        writer.end = start + frame.len() as u64;
        self.tip.send_replace(entry.sequence);
        Ok(())
    }

    /// Iterator over durable entries with `sequence >= from`, in order.
    ///
    /// The iterator covers the log as it is when called; call again (or use a
    /// [`WalCursor`]) to see later entries.
    pub fn read_from(&self, from: u64) -> Result<WalReader, WalError> {
        let from = from.max(1);
        let (offset, last) = {
            let writer = self.lock_writer()?;
            let last = writer.offsets.len() as u64;
            let offset = if from <= last {
                writer.offsets[(from - 1) as usize]
            } else {
                writer.end
            };
            (offset, last)
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(WalReader {
            reader: BufReader::new(file),
            next: from,
            last,
            failed: false,
        })
    }

    /// Up to `max` durable entries starting at `from`.
    pub fn read_batch(&self, from: u64, max: usize) -> Result<Vec<WalEntry>, WalError> {
        self.read_from(from)?.take(max).collect()
    }

    /// Live cursor over the log starting at `from`; it never ends while the log is open.
    pub fn cursor(&self, from: u64) -> WalCursor<'_> {
        WalCursor {
            wal: self,
            tip: self.subscribe(),
            next: from.max(1),
            buffered: VecDeque::new(),
        }
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, WalWriter>, WalError> {
        self.writer.lock().map_err(|_| WalError::Poisoned)
    }
}

/// Restartable snapshot iterator returned by [`WriteAheadLog::read_from`].
pub struct WalReader {
    reader: BufReader<File>,
    next: u64,
    last: u64,
    failed: bool,
}

impl Iterator for WalReader {
    type Item = Result<WalEntry, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next > self.last {
            return None;
        }

        let result = match read_frame(&mut self.reader) {
            Ok(Frame::Entry(entry, _)) if entry.sequence == self.next => {
                self.next += 1;
                Ok(entry)
            }
            Ok(Frame::Entry(..)) => Err(WalError::Corrupted {
                sequence: self.next,
                reason: "sequence mismatch",
            }),
            Ok(Frame::End) => Err(WalError::Corrupted {
                sequence: self.next,
                reason: "unexpected end of log",
            }),
            Ok(Frame::Torn(reason)) => Err(WalError::Corrupted {
                sequence: self.next,
                reason,
            }),
            Err(e) => Err(WalError::Io(e)),
        };

        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Unbounded, lazy view of the log: `next_batch` waits for new durable entries.
pub struct WalCursor<'a> {
    wal: &'a WriteAheadLog,
    tip: watch::Receiver<u64>,
    next: u64,
    buffered: VecDeque<WalEntry>,
}

impl WalCursor<'_> {
    /// Sequence the cursor will yield next.
    pub fn position(&self) -> u64 {
        self.next - self.buffered.len() as u64
    }

    /// Repositions the cursor; used when a follower reports where it actually is.
    pub fn seek(&mut self, sequence: u64) {
        self.buffered.clear();
        self.next = sequence.max(1);
    }

    pub async fn next(&mut self) -> Result<WalEntry, WalError> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Ok(entry);
            }
            let batch = self.next_batch(CURSOR_BATCH).await?;
            self.buffered.extend(batch);
        }
    }

    /// Waits until at least one entry at or after the cursor is durable, then
    /// returns up to `max` of them.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<WalEntry>, WalError> {
        if !self.buffered.is_empty() {
            let take = max.min(self.buffered.len());
            return Ok(self.buffered.drain(..take).collect());
        }

        let want = self.next;
        self.tip
            .wait_for(|&tip| tip >= want)
            .await
            .map_err(|_| WalError::Closed)?;

        let batch = self.wal.read_batch(want, max)?;
        self.next += batch.len() as u64;
        Ok(batch)
    }
}

struct ScanResult {
    offsets: Vec<u64>,
    valid_len: u64,
    stop_reason: Option<&'static str>,
}

fn scan_log(path: &Path) -> Result<ScanResult, WalError> {
    let file = match File::open(path) {
        Ok(file) => file,
        // Missing WAL means no entries to replay.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(ScanResult {
                offsets: Vec::new(),
                valid_len: 0,
                stop_reason: None,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut offsets = Vec::new();
    let mut position = 0u64;
    let mut stop_reason = None;

    loop {
        match read_frame(&mut reader)? {
            Frame::Entry(entry, len) => {
                let expected = offsets.len() as u64 + 1;
                if entry.sequence != expected {
                    stop_reason = Some("sequence gap");
                    break;
                }
                offsets.push(position);
                position += len as u64;
            }
            Frame::End => break,
            Frame::Torn(reason) => {
                stop_reason = Some(reason);
                break;
            }
        }
    }

    Ok(ScanResult {
        offsets,
        valid_len: position,
        stop_reason,
    })
}

enum Frame {
    Entry(WalEntry, usize),
    End,
    Torn(&'static str),
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>, WalError> {
    let payload = serde_json::to_vec(entry)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let read = read_full(reader, &mut header)?;
    if read == 0 {
        return Ok(Frame::End);
    }
    if read < FRAME_HEADER_LEN {
        return Ok(Frame::Torn("short header"));
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_BYTES {
        return Ok(Frame::Torn("oversized frame"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Torn("short payload"));
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Ok(Frame::Torn("checksum mismatch"));
    }

    match serde_json::from_slice::<WalEntry>(&payload) {
        Ok(entry) => Ok(Frame::Entry(entry, FRAME_HEADER_LEN + len)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
