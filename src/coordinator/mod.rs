//! Coordinator Module
//!
//! Process-wide directory and router. The coordinator starts empty and is
//! populated entirely by shard self-registration; clients only ever talk to it.
//!
//! ## Core Concepts
//! - **Registry**: `shard_id -> ShardGroup` (one leader, any number of followers),
//!   upserted atomically per shard id. Registration doubles as the heartbeat.
//! - **Partition rule**: each table hashes partition keys onto a fixed, sorted
//!   list of shard ids. The list is bound once and never changes, since moving
//!   keys would need data migration.
//! - **Liveness**: descriptors not refreshed within the liveness window become
//!   `Unavailable`, and routing to them fails fast.
//! - **Proxying**: record operations are forwarded to the owning leader's
//!   `/storage` endpoint under the key `partition_key[#sort_key]`.

pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod types;

#[cfg(test)]
mod tests;
