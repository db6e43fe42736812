use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::Instrument;

use super::registration::run_registration;
use super::replication::{REORDER_CAPACITY, ReorderBuffer, ReplicationHub, is_running, run_follower_link};
use super::protocol::MAX_REPLICATION_BATCH;
use super::types::{DeleteReceipt, NodePhase, Role, WriteReceipt};
use crate::config::ShardConfig;
use crate::error::KvError;
use crate::storage::engine::StorageEngine;
use crate::storage::snapshot::{load_snapshot, write_snapshot};
use crate::storage::types::Record;
use crate::wal::log::WriteAheadLog;
use crate::wal::types::{NewEntry, RecordValue, WalEntry};

/// One shard process: a WAL, the engine rebuilt from it, and a fixed role.
///
/// Every mutation of the engine goes through `apply_lock`, so WAL order and
/// apply order are the same. On a leader the lock also makes version
/// assignment and append atomic per shard.
pub struct ShardNode {
    config: ShardConfig,
    wal: Arc<WriteAheadLog>,
    engine: StorageEngine,
    apply_lock: Mutex<ReorderBuffer>,
    phase: watch::Sender<NodePhase>,
    hub: Arc<ReplicationHub>,
    /// Followers: leader tip as last reported by the leader.
    leader_tip: AtomicU64,
    since_snapshot: AtomicU64,
    snapshot_in_flight: Arc<AtomicBool>,
    http_client: reqwest::Client,
    /// Span active at `open`; background tasks run inside it.
    span: tracing::Span,
}

impl ShardNode {
    /// Recovers local state: snapshot (if usable) plus WAL replay after it.
    pub fn open(config: ShardConfig) -> anyhow::Result<Arc<Self>> {
        let (phase, _) = watch::channel(NodePhase::Starting);
        tracing::info!(
            "Shard {} ({}) recovering from {}",
            config.shard_id,
            config.role,
            config.data_dir.display()
        );

        let wal = WriteAheadLog::open(&config.data_dir, config.wal_sync)
            .with_context(|| format!("failed to open WAL in {}", config.data_dir.display()))?;

        let engine = match load_snapshot(&config.data_dir)? {
            Some(snapshot) if snapshot.last_applied_sequence <= wal.last_sequence() => {
                tracing::info!(
                    "Loaded snapshot at sequence {}",
                    snapshot.last_applied_sequence
                );
                StorageEngine::from_snapshot(snapshot)
            }
            Some(snapshot) => {
                tracing::warn!(
                    "Snapshot at sequence {} is ahead of the WAL ({}), replaying from scratch",
                    snapshot.last_applied_sequence,
                    wal.last_sequence()
                );
                StorageEngine::new()
            }
            None => StorageEngine::new(),
        };

        let from = engine.last_applied_sequence() + 1;
        let replayed = engine
            .replay(wal.read_from(from)?)
            .context("WAL replay failed")?;

        tracing::info!(
            "Shard {} recovered: {} entries replayed, last sequence {}, {} live keys",
            config.shard_id,
            replayed,
            wal.last_sequence(),
            engine.live_count()
        );

        let http_client = reqwest::Client::new();
        let hub = Arc::new(ReplicationHub::new(
            &config.address,
            http_client.clone(),
            config.heartbeat_interval,
        ));
        phase.send_replace(NodePhase::Registering);

        Ok(Arc::new(Self {
            config,
            wal: Arc::new(wal),
            engine,
            apply_lock: Mutex::new(ReorderBuffer::new(REORDER_CAPACITY)),
            phase,
            hub,
            leader_tip: AtomicU64::new(0),
            since_snapshot: AtomicU64::new(0),
            snapshot_in_flight: Arc::new(AtomicBool::new(false)),
            http_client,
            span: tracing::Span::current(),
        }))
    }

    /// Spawns registration and, on followers, the leader subscription loop.
    pub fn start_background(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(
            async move {
                run_registration(node).await;
            }
            .instrument(self.span.clone()),
        );

        if self.config.role == Role::Follower {
            let node = self.clone();
            tokio::spawn(
                async move {
                    run_follower_link(node).await;
                }
                .instrument(self.span.clone()),
            );
        }
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn hub(&self) -> &ReplicationHub {
        &self.hub
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    /// Span background tasks are spawned into.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    pub fn phase(&self) -> NodePhase {
        *self.phase.borrow()
    }

    /// `Registering -> Active`, once. Later phases are never overridden.
    pub fn mark_registered(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == NodePhase::Registering {
                *phase = NodePhase::Active;
                true
            } else {
                false
            }
        })
    }

    /// Stops accepting writes; reads and replication keep working.
    pub fn drain(&self) {
        tracing::info!("Shard {} draining", self.config.shard_id);
        self.phase.send_replace(NodePhase::Draining);
    }

    /// Ends all background loops.
    pub fn stop(&self) {
        tracing::info!("Shard {} stopped", self.config.shard_id);
        self.hub.close();
        self.phase.send_replace(NodePhase::Stopped);
    }

    /// Sleeps for `duration` unless the node stops first. Returns `false` once stopped.
    pub async fn pause(&self, duration: Duration) -> bool {
        let mut phase = self.phase.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => is_running(self.phase()),
            _ = phase.wait_for(|p| !is_running(*p)) => false,
        }
    }

    // ============================================================
    // CLIENT OPERATIONS
    // ============================================================

    fn ensure_writable(&self) -> Result<(), KvError> {
        if self.config.role != Role::Leader {
            return Err(KvError::WrongRole {
                role: self.config.role,
                leader_address: self.config.leader_url.clone(),
            });
        }
        match self.phase() {
            NodePhase::Draining | NodePhase::Stopped => Err(KvError::Unavailable(format!(
                "shard {} is shutting down",
                self.config.shard_id
            ))),
            _ => Ok(()),
        }
    }

    /// Leader-only upsert. The entry is durable and applied before this returns;
    /// with `AckPolicy::OneFollower` it then waits (bounded) for a follower.
    pub async fn write(
        &self,
        table: &str,
        key: &str,
        value: RecordValue,
    ) -> Result<WriteReceipt, KvError> {
        self.ensure_writable()?;

        let entry = {
            let _guard = self.apply_lock.lock().await;
            let version = self.engine.current_version(table, key) + 1;
            let entry = self
                .wal
                .append(NewEntry::put(table, key, value, version))
                .map_err(|e| KvError::DurabilityFailure(e.to_string()))?;
            self.engine.apply(&entry);
            self.maybe_snapshot(1);
            entry
        };

        tracing::debug!(
            "Wrote {}/{} version {} at sequence {}",
            table,
            key,
            entry.version,
            entry.sequence
        );

        let replicated = self
            .hub
            .await_ack(entry.sequence, self.config.ack_policy)
            .await;

        Ok(WriteReceipt {
            version: entry.version,
            sequence: entry.sequence,
            replicated,
        })
    }

    /// Leader-only tombstone delete. Deleting an absent key appends nothing.
    pub async fn delete(&self, table: &str, key: &str) -> Result<DeleteReceipt, KvError> {
        self.ensure_writable()?;

        let _guard = self.apply_lock.lock().await;
        let previous = match self.engine.get_stored(table, key) {
            Some(stored) if !stored.is_tombstone() => stored.version,
            _ => {
                return Ok(DeleteReceipt {
                    deleted: false,
                    sequence: None,
                });
            }
        };

        let entry = self
            .wal
            .append(NewEntry::delete(table, key, previous + 1))
            .map_err(|e| KvError::DurabilityFailure(e.to_string()))?;
        self.engine.apply(&entry);
        self.maybe_snapshot(1);

        tracing::debug!("Deleted {}/{} at sequence {}", table, key, entry.sequence);
        Ok(DeleteReceipt {
            deleted: true,
            sequence: Some(entry.sequence),
        })
    }

    /// Latest applied state. On a follower this may lag the leader.
    pub fn read(&self, table: &str, key: &str) -> Option<Record> {
        self.engine.get(table, key)
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    pub fn last_applied_sequence(&self) -> u64 {
        self.engine.last_applied_sequence()
    }

    pub fn last_sequence(&self) -> u64 {
        self.wal.last_sequence()
    }

    pub fn observe_leader_tip(&self, sequence: u64) {
        self.leader_tip.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Followers only: how far behind the leader's last reported tip we are.
    pub fn replication_lag(&self) -> Option<u64> {
        match self.config.role {
            Role::Leader => None,
            Role::Follower => Some(
                self.leader_tip
                    .load(Ordering::SeqCst)
                    .saturating_sub(self.wal.last_sequence()),
            ),
        }
    }

    /// Leader side of `subscribe`: (re)starts streaming to `address` from
    /// `last_applied_sequence + 1`. Returns the leader's tip.
    pub fn accept_subscriber(
        &self,
        address: &str,
        last_applied_sequence: u64,
    ) -> Result<u64, KvError> {
        if self.config.role != Role::Leader {
            return Err(KvError::WrongRole {
                role: self.config.role,
                leader_address: self.config.leader_url.clone(),
            });
        }

        let leader_tip = self.wal.last_sequence();
        if last_applied_sequence > leader_tip {
            tracing::warn!(
                "Rejecting follower {}: reports sequence {} beyond our tip {}",
                address,
                last_applied_sequence,
                leader_tip
            );
            return Err(KvError::Diverged(format!(
                "follower at sequence {} but leader tip is {}",
                last_applied_sequence, leader_tip
            )));
        }

        if self.hub.subscribe(address, last_applied_sequence, leader_tip) {
            self.hub
                .spawn_push(self.wal.clone(), address.to_string(), &self.span);
        }
        Ok(leader_tip)
    }

    /// Follower side of a push. Entries are applied strictly in sequence order:
    /// duplicates are skipped, early entries wait in the reorder buffer.
    /// Returns the position after this batch.
    pub async fn apply_replicated(
        &self,
        leader_last_sequence: u64,
        entries: Vec<WalEntry>,
    ) -> Result<u64, KvError> {
        if self.config.role != Role::Follower {
            return Err(KvError::WrongRole {
                role: self.config.role,
                leader_address: None,
            });
        }
        self.observe_leader_tip(leader_last_sequence);

        let mut pending = self.apply_lock.lock().await;
        let mut last = self.wal.last_sequence();

        for entry in entries {
            if entry.sequence <= last {
                tracing::debug!("Skipping duplicate sequence {}", entry.sequence);
                continue;
            }
            if !pending.insert(entry) {
                tracing::warn!("Reorder buffer full, dropping entry");
            }
        }

        let mut applied = 0;
        while let Some(entry) = pending.take(last + 1) {
            if let Err(e) = self.wal.append_replicated(&entry) {
                pending.insert(entry);
                self.maybe_snapshot(applied);
                return Err(KvError::DurabilityFailure(e.to_string()));
            }
            self.engine.apply(&entry);
            last = entry.sequence;
            applied += 1;
        }
        pending.discard_through(last);
        self.maybe_snapshot(applied);

        if !pending.is_empty() {
            tracing::debug!(
                "Waiting for sequence {}, {} entries buffered",
                last + 1,
                pending.len()
            );
        }
        Ok(last)
    }

    /// Durable entries from `start_sequence`, for pull access to the log.
    pub fn read_log(&self, start_sequence: u64, limit: usize) -> Result<Vec<WalEntry>, KvError> {
        let limit = limit.clamp(1, MAX_REPLICATION_BATCH);
        self.wal
            .read_batch(start_sequence.max(1), limit)
            .map_err(|e| KvError::Unavailable(format!("log read failed: {}", e)))
    }

    /// Counts applied entries and, every `snapshot_every`, writes a snapshot on
    /// the blocking pool. Called with `apply_lock` held so the copy taken here is
    /// a consistent prefix. At most one write runs at a time; while one is in
    /// flight the count keeps growing and the next apply retries.
    fn maybe_snapshot(&self, applied: u64) {
        if self.config.snapshot_every == 0 || applied == 0 {
            return;
        }
        let count = self.since_snapshot.fetch_add(applied, Ordering::SeqCst) + applied;
        if count < self.config.snapshot_every {
            return;
        }
        if self
            .snapshot_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.since_snapshot.store(0, Ordering::SeqCst);

        let snapshot = self.engine.snapshot();
        let dir = self.config.data_dir.clone();
        let in_flight = self.snapshot_in_flight.clone();
        let span = self.span.clone();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            if let Err(e) = write_snapshot(&dir, &snapshot) {
                tracing::warn!("Snapshot failed, continuing on WAL only: {}", e);
            }
            in_flight.store(false, Ordering::SeqCst);
        });
    }
}
