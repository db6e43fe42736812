//! Write-Ahead Log Module
//!
//! Per-shard, append-only, strictly ordered log of mutations. The log is both the
//! unit of durability (state is rebuilt by replaying it) and the unit of replication
//! (followers receive its entries in sequence order).
//!
//! ## Core Concepts
//! - **Single writer**: `append` assigns the next sequence under one lock; sequences
//!   start at 1 and are gapless.
//! - **Framing**: every entry is length-prefixed and CRC32-checksummed, so a torn
//!   final write is detected and cut off on reopen.
//! - **Visibility**: an entry becomes readable only after it has been written (and
//!   synced, unless syncing is disabled). The durable tip is published on a
//!   `watch` channel that live readers wait on.

pub mod log;
pub mod types;

#[cfg(test)]
mod tests;
