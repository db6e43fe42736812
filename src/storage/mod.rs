//! Storage Engine Module
//!
//! In-memory keyed store for one shard, rebuilt deterministically by replaying the
//! WAL. The engine knows nothing about the network or about roles: it is a pure
//! function of the WAL prefix applied to it.
//!
//! ## Core Concepts
//! - **Tables**: records are grouped `table -> storage key -> record`.
//! - **Tombstones**: deletes keep a versioned tombstone so replay stays deterministic
//!   and later writes keep increasing the version.
//! - **Idempotent apply**: every stored record remembers the sequence that produced
//!   it; re-applying that sequence (or an older one) is a no-op.
//! - **Snapshots**: the whole engine can be written to disk and restored, so recovery
//!   only replays the WAL tail.

pub mod engine;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod tests;
