use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::Instrument;

use super::backoff::Backoff;
use super::node::ShardNode;
use super::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, ENDPOINT_REPLICATION_APPEND,
    ENDPOINT_REPLICATION_SUBSCRIBE, MAX_REPLICATION_BATCH, SubscribeRequest, SubscribeResponse,
};
use super::types::{AckPolicy, NodePhase};
use crate::wal::log::WriteAheadLog;
use crate::wal::types::{WalEntry, WalError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_FOLLOWER_EXPIRY: Duration = Duration::from_secs(30);

/// Entries a follower holds while waiting for a missing predecessor.
pub const REORDER_CAPACITY: usize = 4096;

// ============================================================
// LEADER SIDE
// ============================================================

struct FollowerCursor {
    /// Next sequence to push; rewritten on every subscribe and ack.
    next_sequence: u64,
    acked_sequence: u64,
    last_contact: Instant,
    /// Set by `subscribe`, consumed by the push task to reposition its cursor.
    resync: Option<u64>,
    task_running: bool,
}

/// Point-in-time view of one follower, as exposed by `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerStatus {
    pub address: String,
    pub acked_sequence: u64,
    pub next_sequence: u64,
    pub idle_ms: u64,
}

/// Tracks followers of a leader and pushes its WAL to each of them.
///
/// One push task per follower address streams entries in sequence order from a
/// WAL cursor. The follower's reply (its `last_applied_sequence`) is the only
/// resume point: the cursor is repositioned to `last_applied + 1` after every
/// response, which covers catch-up, duplicates and gaps alike.
pub struct ReplicationHub {
    leader_address: String,
    followers: DashMap<String, FollowerCursor>,
    /// Highest sequence acknowledged by any follower.
    acked: watch::Sender<u64>,
    http_client: reqwest::Client,
    heartbeat: Duration,
    closed: AtomicBool,
}

impl ReplicationHub {
    pub fn new(leader_address: &str, http_client: reqwest::Client, heartbeat: Duration) -> Self {
        let (acked, _) = watch::channel(0);
        Self {
            leader_address: leader_address.to_string(),
            followers: DashMap::new(),
            acked,
            http_client,
            heartbeat,
            closed: AtomicBool::new(false),
        }
    }

    /// Registers (or refreshes) a follower. Returns `true` when no push task is
    /// running for it and the caller must spawn one.
    ///
    /// Positions are clamped to `leader_tip`: nothing past our own log counts as acked.
    pub fn subscribe(&self, address: &str, last_applied_sequence: u64, leader_tip: u64) -> bool {
        let last_applied_sequence = last_applied_sequence.min(leader_tip);
        let next = last_applied_sequence + 1;
        let spawn = match self.followers.entry(address.to_string()) {
            Entry::Occupied(mut existing) => {
                let cursor = existing.get_mut();
                cursor.next_sequence = next;
                cursor.acked_sequence = cursor.acked_sequence.max(last_applied_sequence);
                cursor.last_contact = Instant::now();
                cursor.resync = Some(next);
                if cursor.task_running {
                    false
                } else {
                    cursor.task_running = true;
                    true
                }
            }
            Entry::Vacant(slot) => {
                tracing::info!(
                    "Follower {} subscribed at sequence {}",
                    address,
                    last_applied_sequence
                );
                slot.insert(FollowerCursor {
                    next_sequence: next,
                    acked_sequence: last_applied_sequence,
                    last_contact: Instant::now(),
                    resync: None,
                    task_running: true,
                });
                true
            }
        };

        self.publish_ack(last_applied_sequence);
        spawn
    }

    pub fn record_ack(&self, address: &str, last_applied_sequence: u64, leader_tip: u64) {
        let last_applied_sequence = last_applied_sequence.min(leader_tip);
        if let Some(mut cursor) = self.followers.get_mut(address) {
            cursor.acked_sequence = cursor.acked_sequence.max(last_applied_sequence);
            cursor.next_sequence = last_applied_sequence + 1;
            cursor.last_contact = Instant::now();
        }
        self.publish_ack(last_applied_sequence);
    }

    fn publish_ack(&self, sequence: u64) {
        self.acked.send_if_modified(|current| {
            if sequence > *current {
                *current = sequence;
                true
            } else {
                false
            }
        });
    }

    /// Waits according to the ack policy. `None` under `LeaderOnly`; otherwise
    /// whether a follower applied `sequence` before the timeout.
    pub async fn await_ack(&self, sequence: u64, policy: AckPolicy) -> Option<bool> {
        match policy {
            AckPolicy::LeaderOnly => None,
            AckPolicy::OneFollower { timeout } => {
                let mut acked = self.acked.subscribe();
                let reached = tokio::time::timeout(timeout, acked.wait_for(|&a| a >= sequence))
                    .await
                    .map(|result| result.is_ok())
                    .unwrap_or(false);
                if !reached {
                    tracing::warn!(
                        "No follower acknowledged sequence {} within {:?}",
                        sequence,
                        timeout
                    );
                }
                Some(reached)
            }
        }
    }

    pub fn statuses(&self) -> Vec<FollowerStatus> {
        let mut statuses: Vec<FollowerStatus> = self
            .followers
            .iter()
            .map(|follower| FollowerStatus {
                address: follower.key().clone(),
                acked_sequence: follower.acked_sequence,
                next_sequence: follower.next_sequence,
                idle_ms: follower.last_contact.elapsed().as_millis() as u64,
            })
            .collect();
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }

    /// Stops every push task at its next wakeup.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn expiry(&self) -> Duration {
        (self.heartbeat * 6).max(MIN_FOLLOWER_EXPIRY)
    }

    fn take_resync(&self, address: &str) -> Option<u64> {
        self.followers
            .get_mut(address)
            .and_then(|mut cursor| cursor.resync.take())
    }

    /// Drops a follower that stopped talking to us. Returns `true` when it was removed.
    fn expire_if_idle(&self, address: &str) -> bool {
        let expiry = self.expiry();
        self.followers
            .remove_if(address, |_, cursor| cursor.last_contact.elapsed() > expiry)
            .is_some()
    }

    fn finish_task(&self, address: &str) {
        if let Some(mut cursor) = self.followers.get_mut(address) {
            cursor.task_running = false;
        }
    }

    pub fn spawn_push(
        self: &Arc<Self>,
        wal: Arc<WriteAheadLog>,
        address: String,
        parent: &tracing::Span,
    ) {
        let hub = self.clone();
        let span = tracing::info_span!(parent: parent, "push", follower = %address);
        tokio::spawn(
            async move {
                hub.run_push(wal, address).await;
            }
            .instrument(span),
        );
    }

    async fn run_push(&self, wal: Arc<WriteAheadLog>, address: String) {
        let start = self
            .followers
            .get(&address)
            .map(|cursor| cursor.next_sequence)
            .unwrap_or(1);
        let url = format!("{}{}", address, ENDPOINT_REPLICATION_APPEND);
        let mut cursor = wal.cursor(start);
        let mut backoff = Backoff::new();

        tracing::info!("Starting push to {} from sequence {}", address, start);

        loop {
            if self.is_closed() {
                break;
            }
            if self.expire_if_idle(&address) {
                tracing::warn!("Follower {} went silent, dropping its stream", address);
                return;
            }
            if let Some(sequence) = self.take_resync(&address) {
                cursor.seek(sequence);
            }

            let sent_from = cursor.position();
            let entries = match tokio::time::timeout(
                self.heartbeat,
                cursor.next_batch(MAX_REPLICATION_BATCH),
            )
            .await
            {
                Ok(Ok(entries)) => entries,
                Ok(Err(WalError::Closed)) => break,
                Ok(Err(e)) => {
                    tracing::error!("Failed to read WAL for {}: {}", address, e);
                    cursor.seek(sent_from);
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
                // Idle: send an empty batch so the follower learns our tip.
                Err(_) => Vec::new(),
            };

            let batch_len = entries.len();
            let request = AppendEntriesRequest {
                leader_address: self.leader_address.clone(),
                leader_last_sequence: wal.last_sequence(),
                entries,
            };

            match self.send_append(&url, &request).await {
                Ok(response) => {
                    backoff.reset();
                    let leader_tip = wal.last_sequence();
                    if response.last_applied_sequence > leader_tip {
                        tracing::warn!(
                            "Follower {} reports sequence {} beyond our tip {}, dropping its stream",
                            address,
                            response.last_applied_sequence,
                            leader_tip
                        );
                        self.followers.remove(&address);
                        return;
                    }
                    self.record_ack(&address, response.last_applied_sequence, leader_tip);
                    cursor.seek(response.last_applied_sequence + 1);
                    if batch_len > 0 {
                        tracing::debug!(
                            "Pushed {} entries to {}, follower at {}",
                            batch_len,
                            address,
                            response.last_applied_sequence
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("Push to {} failed: {}", address, e);
                    cursor.seek(sent_from);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }

        self.finish_task(&address);
        tracing::info!("Push task for {} stopped", address);
    }

    async fn send_append(
        &self,
        url: &str,
        request: &AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let response = self
            .http_client
            .post(url)
            .json(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("follower answered {}", response.status());
        }
        Ok(response.json::<AppendEntriesResponse>().await?)
    }
}

// ============================================================
// FOLLOWER SIDE
// ============================================================

/// Entries received ahead of the follower's position, keyed by sequence.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, WalEntry>,
    capacity: usize,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            capacity,
        }
    }

    /// Holds an early entry. Returns `false` (dropping it) when full; the leader
    /// resends it after the follower reports its position.
    pub fn insert(&mut self, entry: WalEntry) -> bool {
        if self.pending.len() >= self.capacity && !self.pending.contains_key(&entry.sequence) {
            return false;
        }
        self.pending.insert(entry.sequence, entry);
        true
    }

    /// Removes and returns the entry with exactly this sequence.
    pub fn take(&mut self, sequence: u64) -> Option<WalEntry> {
        self.pending.remove(&sequence)
    }

    /// Forgets everything at or below `sequence`.
    pub fn discard_through(&mut self, sequence: u64) {
        self.pending = self.pending.split_off(&(sequence + 1));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Keeps a follower subscribed to its leader: after recovery, and again every
/// heartbeat so a restarted leader picks the follower back up.
pub async fn run_follower_link(node: Arc<ShardNode>) {
    let Some(leader_url) = node.config().leader_url.clone() else {
        tracing::error!("Follower has no leader address, replication disabled");
        return;
    };
    let url = format!("{}{}", leader_url, ENDPOINT_REPLICATION_SUBSCRIBE);
    let mut backoff = Backoff::new();

    loop {
        let request = SubscribeRequest {
            address: node.config().address.clone(),
            last_applied_sequence: node.last_applied_sequence(),
        };

        let delay = match subscribe_once(node.http_client(), &url, &request).await {
            Ok(response) => {
                node.observe_leader_tip(response.leader_last_sequence);
                backoff.reset();
                tracing::debug!(
                    "Subscribed to {} at {}, leader at {}",
                    leader_url,
                    request.last_applied_sequence,
                    response.leader_last_sequence
                );
                node.config().heartbeat_interval
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Subscribing to leader {} failed: {}. Retrying in {:?}",
                    leader_url,
                    e,
                    delay
                );
                delay
            }
        };

        if !node.pause(delay).await {
            break;
        }
    }

    tracing::info!("Follower link to {} stopped", leader_url);
}

async fn subscribe_once(
    client: &reqwest::Client,
    url: &str,
    request: &SubscribeRequest,
) -> anyhow::Result<SubscribeResponse> {
    let response = client
        .post(url)
        .json(request)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("leader answered {}", response.status());
    }
    Ok(response.json::<SubscribeResponse>().await?)
}

/// Phases in which background loops keep running.
pub(crate) fn is_running(phase: NodePhase) -> bool {
    !matches!(phase, NodePhase::Stopped)
}
