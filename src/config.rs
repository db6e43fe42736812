//! Process configuration.
//!
//! Both processes are configured through environment variables (the deployment
//! sets them per container). `--bind` on the command line overrides `BIND_ADDR`.
//! Unparseable optional values fall back to their defaults with a warning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::shard::types::{AckPolicy, Role};
use crate::wal::types::SyncPolicy;

const DEFAULT_SNAPSHOT_EVERY: u64 = 1000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;
const DEFAULT_HEARTBEAT_MS: u64 = 5000;
const DEFAULT_LIVENESS_WINDOW_MS: u64 = 15_000;

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: String,
    pub role: Role,
    pub bind_addr: SocketAddr,
    /// Base URL other processes use to reach this node.
    pub address: String,
    pub coordinator_url: Option<String>,
    /// Leader base URL; required for followers.
    pub leader_url: Option<String>,
    pub data_dir: PathBuf,
    pub wal_sync: SyncPolicy,
    /// Applied entries between snapshots; 0 disables snapshots.
    pub snapshot_every: u64,
    pub ack_policy: AckPolicy,
    pub heartbeat_interval: Duration,
}

impl ShardConfig {
    /// Configuration with defaults for everything but identity.
    pub fn new(shard_id: &str, role: Role, address: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            role,
            bind_addr: default_bind_addr(),
            address: address.trim_end_matches('/').to_string(),
            coordinator_url: None,
            leader_url: None,
            data_dir: data_dir.into(),
            wal_sync: SyncPolicy::Always,
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            ack_policy: AckPolicy::LeaderOnly,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
        }
    }

    pub fn from_env(bind_override: Option<SocketAddr>) -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), bind_override)
    }

    pub fn from_lookup<F>(lookup: F, bind_override: Option<SocketAddr>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let role = match lookup("ROLE") {
            Some(raw) => raw.parse::<Role>().map_err(anyhow::Error::msg)?,
            None => Role::Leader,
        };
        let shard_id = non_empty(lookup("SHARD_ID")).unwrap_or_else(|| "unknown-shard".to_string());

        let bind_addr = match bind_override {
            Some(addr) => addr,
            None => match non_empty(lookup("BIND_ADDR")) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid BIND_ADDR '{}'", raw))?,
                None => default_bind_addr(),
            },
        };

        let address = match non_empty(lookup("MY_ADDRESS")) {
            Some(address) => address,
            None => {
                let host = non_empty(lookup("HOSTNAME")).unwrap_or_else(|| "localhost".to_string());
                format!("http://{}:{}", host, bind_addr.port())
            }
        };

        let leader_url = non_empty(lookup("LEADER_URL"));
        if role == Role::Follower && leader_url.is_none() {
            anyhow::bail!("LEADER_URL is required when ROLE=follower");
        }

        let data_dir = non_empty(lookup("DATA_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data").join(&shard_id));

        let ack_policy = match non_empty(lookup("REPLICATION_ACK")).as_deref() {
            Some("one") => AckPolicy::OneFollower {
                timeout: Duration::from_millis(parse_or(
                    &lookup,
                    "REPLICATION_ACK_TIMEOUT_MS",
                    DEFAULT_ACK_TIMEOUT_MS,
                )),
            },
            Some("leader") | None => AckPolicy::LeaderOnly,
            Some(other) => {
                tracing::warn!("Unknown REPLICATION_ACK '{}', using leader-only", other);
                AckPolicy::LeaderOnly
            }
        };

        let mut config = Self::new(&shard_id, role, &address, data_dir);
        config.bind_addr = bind_addr;
        config.coordinator_url = non_empty(lookup("COORDINATOR_URL"))
            .map(|url| url.trim_end_matches('/').to_string());
        config.leader_url = leader_url.map(|url| url.trim_end_matches('/').to_string());
        config.wal_sync = parse_or(&lookup, "WAL_FSYNC", SyncPolicy::Always);
        config.snapshot_every = parse_or(&lookup, "SNAPSHOT_EVERY", DEFAULT_SNAPSHOT_EVERY);
        config.ack_policy = ack_policy;
        config.heartbeat_interval = Duration::from_millis(
            parse_or(&lookup, "HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_MS).max(1),
        );
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,
    /// Descriptors not refreshed within this window are marked unavailable.
    pub liveness_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            liveness_window: Duration::from_millis(DEFAULT_LIVENESS_WINDOW_MS),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env(bind_override: Option<SocketAddr>) -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), bind_override)
    }

    pub fn from_lookup<F>(lookup: F, bind_override: Option<SocketAddr>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = match bind_override {
            Some(addr) => addr,
            None => match non_empty(lookup("BIND_ADDR")) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid BIND_ADDR '{}'", raw))?,
                None => default_bind_addr(),
            },
        };

        Ok(Self {
            bind_addr,
            liveness_window: Duration::from_millis(parse_or(
                &lookup,
                "LIVENESS_WINDOW_MS",
                DEFAULT_LIVENESS_WINDOW_MS,
            )),
        })
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match non_empty(lookup(name)) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring invalid {}='{}': {}", name, raw, e);
                default
            }
        },
        None => default,
    }
}
