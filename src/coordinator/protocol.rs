//! Coordinator Network Protocol
//!
//! The client-facing table API plus the internal registration endpoint used by
//! shards.

use serde::{Deserialize, Serialize};

use super::types::{ShardGroup, TableDef};
use crate::shard::types::Role;
use crate::wal::types::RecordValue;

// --- API Endpoints ---

pub const ENDPOINT_TABLES: &str = "/tables";
/// Internal: shard -> coordinator registration and heartbeat.
pub const ENDPOINT_REGISTER_SHARD: &str = "/shards/register";
pub const ENDPOINT_SHARDS: &str = "/shards";
pub const ENDPOINT_HEALTH: &str = "/health";

/// Replicas consulted by a quorum read when `r` is not given.
pub const DEFAULT_QUORUM: usize = 2;

// --- Tables ---

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    /// Shard groups the table is partitioned over. Defaults to every group
    /// registered at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTableResponse {
    pub status: String,
    pub table: TableDef,
}

// --- Records ---

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteRecordRequest {
    pub partition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
    pub value: serde_json::Value,
}

/// Optional `?sort_key=` on point operations.
#[derive(Debug, Default, Deserialize)]
pub struct RecordQuery {
    pub sort_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QuorumQuery {
    pub sort_key: Option<String>,
    #[serde(alias = "R")]
    pub r: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct QuorumReadResponse {
    pub value: RecordValue,
    pub version: u64,
    /// At least `r` replicas answered.
    pub quorum_met: bool,
    pub responses: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub status: String,
}

// --- Shards ---

/// Registration / heartbeat descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterShardRequest {
    pub shard_id: String,
    pub role: Role,
    #[serde(alias = "url")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterShardResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub groups: Vec<ShardGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinatorHealthResponse {
    pub status: String,
    pub tables: usize,
    pub shard_groups: usize,
    pub healthy_leaders: usize,
}
