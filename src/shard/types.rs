use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Externally assigned role. There is no promotion logic: a node keeps its role
/// for its whole life.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Lifecycle of a shard process.
///
/// `Starting` covers WAL recovery; `Registering` lasts until the coordinator first
/// acknowledges the descriptor. Requests are served from `Registering` on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Starting,
    Registering,
    Active,
    Draining,
    Stopped,
}

/// How long a leader write waits for followers before acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge once locally durable.
    LeaderOnly,
    /// Additionally wait (bounded) for any follower to apply the entry.
    OneFollower { timeout: Duration },
}

/// Result of a successful leader write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub version: u64,
    pub sequence: u64,
    /// `None` under `AckPolicy::LeaderOnly`.
    pub replicated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReceipt {
    pub deleted: bool,
    pub sequence: Option<u64>,
}
