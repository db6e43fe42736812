use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::shard::types::Role;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShardHealth {
    Healthy,
    Unavailable,
}

/// What the coordinator knows about one shard process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub role: Role,
    pub address: String,
    pub leader_address: Option<String>,
    pub health: ShardHealth,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,

    /// Monotonic time of the last registration; drives the liveness window.
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl ShardDescriptor {
    pub fn is_live(&self, window: std::time::Duration) -> bool {
        self.health == ShardHealth::Healthy
            && self
                .last_seen
                .map(|seen| seen.elapsed() <= window)
                .unwrap_or(false)
    }
}

/// One leader and its followers, keyed by `shard_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardGroup {
    pub shard_id: String,
    pub leader: Option<ShardDescriptor>,
    pub followers: Vec<ShardDescriptor>,
}

/// How a table's partition keys map onto shard groups. Fixed once bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum PartitionRule {
    /// `shard_ids[crc32(partition_key) % len]`.
    Hash { shard_ids: Vec<String> },
}

impl PartitionRule {
    pub fn shard_for(&self, partition_key: &str) -> Option<&str> {
        match self {
            PartitionRule::Hash { shard_ids } => {
                if shard_ids.is_empty() {
                    return None;
                }
                let hash = crc32fast::hash(partition_key.as_bytes()) as usize;
                shard_ids.get(hash % shard_ids.len()).map(String::as_str)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// `None` until the first shard group is known.
    pub rule: Option<PartitionRule>,
    pub created_at_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
