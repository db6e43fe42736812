//! Partitioned, Replicated Key-Value Store
//!
//! A coordinator routes reads and writes by table and partition key to shard
//! groups. Each shard group has one leader, the single writer, and any number
//! of followers that durably replay the leader's write-ahead log.
//!
//! ## Architecture Modules
//! - **`wal`**: the per-shard append-only log. Checksummed frames, gapless
//!   sequences and an async tail cursor.
//! - **`storage`**: the in-memory engine rebuilt by replaying the WAL, plus snapshots.
//! - **`shard`**: the shard process. Leader writes, follower apply, leader-push
//!   replication and self-registration.
//! - **`coordinator`**: the shard registry, partition rules and the client-facing
//!   proxy.
//! - **`config`** / **`error`**: environment configuration and the shared error
//!   taxonomy.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod shard;
pub mod storage;
pub mod wal;
