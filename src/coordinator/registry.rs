use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::protocol::RegisterShardRequest;
use super::types::{PartitionRule, ShardDescriptor, ShardGroup, ShardHealth, TableDef, now_ms};
use crate::error::KvError;
use crate::shard::types::Role;

/// Directory of shard groups and tables.
///
/// All mutation of a group happens inside its map entry guard, which is the
/// per-`shard_id` lock: concurrent registrations of one shard never interleave.
pub struct ShardRegistry {
    groups: DashMap<String, ShardGroup>,
    tables: DashMap<String, TableDef>,
    liveness_window: Duration,
}

impl ShardRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            tables: DashMap::new(),
            liveness_window,
        }
    }

    // ============================================================
    // REGISTRATION
    // ============================================================

    /// Idempotent upsert of a shard descriptor; also serves as its heartbeat.
    pub fn register_shard(&self, req: RegisterShardRequest) -> ShardDescriptor {
        let now = now_ms();
        let address = req.address.trim_end_matches('/').to_string();

        let mut group = self
            .groups
            .entry(req.shard_id.clone())
            .or_insert_with(|| ShardGroup {
                shard_id: req.shard_id.clone(),
                ..Default::default()
            });

        let fresh = |registered_at_ms: u64| ShardDescriptor {
            shard_id: req.shard_id.clone(),
            role: req.role,
            address: address.clone(),
            leader_address: req.leader_address.clone(),
            health: ShardHealth::Healthy,
            registered_at_ms,
            last_heartbeat_ms: now,
            last_seen: Some(Instant::now()),
        };

        match req.role {
            Role::Leader => {
                group.followers.retain(|f| f.address != address);
                let registered_at_ms = match &group.leader {
                    Some(current) if current.address == address => current.registered_at_ms,
                    Some(current) => {
                        tracing::warn!(
                            "Shard {} leader changed: {} -> {}",
                            req.shard_id,
                            current.address,
                            address
                        );
                        now
                    }
                    None => {
                        tracing::info!("Registered leader for {}: {}", req.shard_id, address);
                        now
                    }
                };
                let descriptor = fresh(registered_at_ms);
                group.leader = Some(descriptor.clone());
                descriptor
            }
            Role::Follower => {
                if group
                    .leader
                    .as_ref()
                    .is_some_and(|leader| leader.address == address)
                {
                    group.leader = None;
                }
                match group.followers.iter_mut().find(|f| f.address == address) {
                    Some(existing) => {
                        let descriptor = fresh(existing.registered_at_ms);
                        *existing = descriptor.clone();
                        descriptor
                    }
                    None => {
                        tracing::info!("Registered follower for {}: {}", req.shard_id, address);
                        let descriptor = fresh(now);
                        group.followers.push(descriptor.clone());
                        descriptor
                    }
                }
            }
        }
    }

    pub fn groups(&self) -> Vec<ShardGroup> {
        let mut groups: Vec<ShardGroup> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        groups
    }

    fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        ids.sort();
        ids
    }

    // ============================================================
    // TABLES
    // ============================================================

    /// Creates a table. Returns `false` if it already existed (left unchanged).
    pub fn create_table(&self, name: &str, shards: Option<Vec<String>>) -> Result<bool, KvError> {
        if name.trim().is_empty() {
            return Err(KvError::MalformedRequest("table name is empty".to_string()));
        }

        let rule = match shards {
            Some(ids) if ids.is_empty() => {
                return Err(KvError::MalformedRequest(
                    "shards must not be empty".to_string(),
                ));
            }
            Some(mut ids) => {
                ids.sort();
                ids.dedup();
                Some(PartitionRule::Hash { shard_ids: ids })
            }
            None => {
                let ids = self.group_ids();
                (!ids.is_empty()).then_some(PartitionRule::Hash { shard_ids: ids })
            }
        };

        match self.tables.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                tracing::info!("Created table {} with rule {:?}", name, rule);
                slot.insert(TableDef {
                    name: name.to_string(),
                    rule,
                    created_at_ms: now_ms(),
                });
                Ok(true)
            }
        }
    }

    pub fn table(&self, name: &str) -> Option<TableDef> {
        self.tables.get(name).map(|t| t.value().clone())
    }

    pub fn tables(&self) -> Vec<TableDef> {
        let mut tables: Vec<TableDef> = self.tables.iter().map(|t| t.value().clone()).collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    // ============================================================
    // ROUTING
    // ============================================================

    /// Shard id owning `partition_key` in `table`. Binds the table's rule on
    /// first use if it was created before any shard registered.
    pub fn resolve_shard(&self, table: &str, partition_key: &str) -> Result<String, KvError> {
        let mut def = self
            .tables
            .get_mut(table)
            .ok_or_else(|| KvError::TableNotFound(table.to_string()))?;

        if def.rule.is_none() {
            let ids = self.group_ids();
            if ids.is_empty() {
                return Err(KvError::Unavailable("no shard groups registered".to_string()));
            }
            tracing::info!("Binding table {} to shards {:?}", table, ids);
            def.rule = Some(PartitionRule::Hash { shard_ids: ids });
        }

        def.rule
            .as_ref()
            .and_then(|rule| rule.shard_for(partition_key))
            .map(str::to_string)
            .ok_or_else(|| KvError::Unavailable(format!("table {} has no shards", table)))
    }

    /// Leader address for a write. Fails fast when the leader is missing or stale.
    pub fn route_write(&self, table: &str, partition_key: &str) -> Result<String, KvError> {
        let shard_id = self.resolve_shard(table, partition_key)?;
        let group = self
            .groups
            .get(&shard_id)
            .ok_or_else(|| KvError::Unavailable(format!("shard {} is not registered", shard_id)))?;

        match &group.leader {
            Some(leader) if leader.is_live(self.liveness_window) => Ok(leader.address.clone()),
            Some(leader) => Err(KvError::Unavailable(format!(
                "leader {} of shard {} is unavailable",
                leader.address, shard_id
            ))),
            None => Err(KvError::Unavailable(format!(
                "shard {} has no leader",
                shard_id
            ))),
        }
    }

    /// Reads go to the leader.
    pub fn route_read(&self, table: &str, partition_key: &str) -> Result<String, KvError> {
        self.route_write(table, partition_key)
    }

    /// Every live replica (leader first) of the owning group.
    pub fn route_replicas(&self, table: &str, partition_key: &str) -> Result<Vec<String>, KvError> {
        let shard_id = self.resolve_shard(table, partition_key)?;
        let group = self
            .groups
            .get(&shard_id)
            .ok_or_else(|| KvError::Unavailable(format!("shard {} is not registered", shard_id)))?;

        let replicas: Vec<String> = group
            .leader
            .iter()
            .chain(group.followers.iter())
            .filter(|d| d.is_live(self.liveness_window))
            .map(|d| d.address.clone())
            .collect();

        if replicas.is_empty() {
            return Err(KvError::Unavailable(format!(
                "shard {} has no live replicas",
                shard_id
            )));
        }
        Ok(replicas)
    }

    // ============================================================
    // HEALTH
    // ============================================================

    /// Marks descriptors not refreshed within the liveness window as
    /// unavailable. Returns how many changed.
    pub fn sweep(&self) -> usize {
        let window = self.liveness_window;
        let mut marked = 0;

        for mut group in self.groups.iter_mut() {
            let shard_id = group.shard_id.clone();
            let group = group.value_mut();
            for descriptor in group.leader.iter_mut().chain(group.followers.iter_mut()) {
                let stale = descriptor
                    .last_seen
                    .map(|seen| seen.elapsed() > window)
                    .unwrap_or(true);
                if stale && descriptor.health == ShardHealth::Healthy {
                    tracing::warn!(
                        "Shard {} {} at {} missed its heartbeat, marking unavailable",
                        shard_id,
                        descriptor.role,
                        descriptor.address
                    );
                    descriptor.health = ShardHealth::Unavailable;
                    marked += 1;
                }
            }
        }
        marked
    }

    pub fn healthy_leaders(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| {
                g.leader
                    .as_ref()
                    .is_some_and(|leader| leader.is_live(self.liveness_window))
            })
            .count()
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        let period = (self.liveness_window / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.sweep();
            }
        });
    }
}
