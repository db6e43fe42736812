//! Shard Node Module
//!
//! A shard is one partition of the keyspace, served by a single leader and any
//! number of followers. Roles are assigned by configuration and never change.
//!
//! ## Core Concepts
//! - **Single writer**: only the leader accepts client writes. It assigns the
//!   per-key version, appends to its WAL, applies to the engine, and answers once
//!   the entry is durable. Writes sent to a follower fail with `WrongRole`.
//! - **Leader push**: each follower subscribes with its `last_applied_sequence`;
//!   the leader streams its WAL to it from the next sequence (`replication`).
//!   The follower's own durable state is the resume point after any restart.
//! - **Ordered apply**: followers apply exactly `last + 1`, skip duplicates and
//!   buffer early entries until the gap is filled.
//! - **Self-registration**: the node registers with the coordinator in the
//!   background, retrying forever, and repeats it as a heartbeat.
//!
//! ## Submodules
//! - **`node`**: `ShardNode`, recovery and the read/write/apply paths.
//! - **`replication`**: leader-side push tasks and the follower subscription loop.
//! - **`registration`**: registration/heartbeat loop against the coordinator.
//! - **`protocol`** / **`handlers`**: the HTTP surface.

pub mod backoff;
pub mod handlers;
pub mod node;
pub mod protocol;
pub mod registration;
pub mod replication;
pub mod types;
