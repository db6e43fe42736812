//! Shard Network Protocol
//!
//! Endpoints and DTOs exposed by a shard node: the storage API the coordinator
//! proxies to, and the replication API between a leader and its followers.

use serde::{Deserialize, Serialize};

use super::replication::FollowerStatus;
use super::types::{NodePhase, Role};
use crate::wal::types::{RecordValue, WalEntry};

// --- API Endpoints ---

/// Point operations on `/storage/{table}/{key}`.
pub const ENDPOINT_STORAGE: &str = "/storage";
/// Follower -> leader: start or resume a replication stream.
pub const ENDPOINT_REPLICATION_SUBSCRIBE: &str = "/replication/subscribe";
/// Leader -> follower: push a batch of WAL entries.
pub const ENDPOINT_REPLICATION_APPEND: &str = "/replication/append";
/// Pull access to the leader's log.
pub const ENDPOINT_REPLICATION_LOG: &str = "/replication/log";
pub const ENDPOINT_HEALTH: &str = "/health";
pub const ENDPOINT_DEBUG_DUMP: &str = "/debug/dump";

/// Largest batch a leader pushes or serves in one request.
pub const MAX_REPLICATION_BATCH: usize = 256;

// --- Storage ---

/// Write payload. `value` must be a JSON object.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WriteResponse {
    pub version: u64,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadResponse {
    pub value: RecordValue,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteResponse {
    /// `false` when the key was already absent.
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

// --- Replication ---

/// Sent by a follower after recovery and then on every heartbeat.
///
/// The leader resumes the stream at `last_applied_sequence + 1`; the follower's
/// durable state is the resume point, not anything the leader remembers.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub address: String,
    pub last_applied_sequence: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub leader_last_sequence: u64,
}

/// A batch of consecutive WAL entries pushed by the leader. May be empty, in
/// which case it only carries the leader's tip.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_address: String,
    pub leader_last_sequence: u64,
    pub entries: Vec<WalEntry>,
}

/// The follower's position after applying what it could of the batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub last_applied_sequence: u64,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub start_sequence: Option<u64>,
    pub limit: Option<usize>,
}

// --- Introspection ---

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub shard_id: String,
    pub role: Role,
    pub phase: NodePhase,
    pub last_applied_sequence: u64,
    pub keys: usize,
    /// Followers only: leader tip minus local position, as last reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_lag: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followers: Vec<FollowerStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DumpResponse {
    pub count: usize,
    /// `table/key` for every live record.
    pub keys: Vec<String>,
}
