//! Timing and fan-out knobs for the cluster core.
//!
//! Loaded from the `[cluster]` table of the daemon's `config.toml`; every
//! field is optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// How often the leader heartbeats the other members.
    pub heartbeat_interval_ms: u64,
    /// A member whose last heartbeat is older than this is reported offline.
    pub offline_threshold_ms: u64,
    /// Per-peer deadline for config notifications and heartbeats.
    pub notify_timeout_ms: u64,
    /// Peers contacted at once during a broadcast.
    pub notify_concurrency: usize,
    /// How long finished operations stay queryable.
    pub operation_retention_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            offline_threshold_ms: 20_000,
            notify_timeout_ms: 5_000,
            notify_concurrency: 8,
            operation_retention_ms: 300_000,
        }
    }
}

impl ClusterSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_threshold_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn operation_retention(&self) -> Duration {
        Duration::from_millis(self.operation_retention_ms)
    }
}
