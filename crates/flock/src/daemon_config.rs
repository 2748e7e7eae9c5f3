//! Daemon configuration: `<data-dir>/config.toml`.
//!
//! A commented default file is written on first start. Every key is
//! optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use flock_cluster::settings::ClusterSettings;
use serde::Deserialize;

/// Content for a freshly created config.toml.
const DEFAULT_CONFIG_TOML: &str = "\
# flock daemon configuration

[daemon]
# Admin socket (default: <data-dir>/unix.socket)
# socket = \"/run/flock/unix.socket\"
# shutdown_timeout_secs = 20

[cluster]
# heartbeat_interval_ms = 10000
# offline_threshold_ms = 20000
# notify_timeout_ms = 5000
# notify_concurrency = 8
# operation_retention_ms = 300000
";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub cluster: ClusterSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSection {
    pub socket: Option<PathBuf>,
    pub shutdown_timeout_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket: None,
            shutdown_timeout_secs: 20,
        }
    }
}

impl DaemonConfig {
    /// Read `config.toml`, writing the default file first when absent.
    pub fn load_or_init(data_dir: &Path) -> anyhow::Result<Self> {
        let path = flock_common::paths::config_path(data_dir);
        if !path.exists() {
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("creating {}", data_dir.display()))?;
            std::fs::write(&path, DEFAULT_CONFIG_TOML)
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Created default config");
        }
        Self::load(&path)
    }

    /// Read `config.toml` if present; defaults otherwise.
    pub fn load_if_present(data_dir: &Path) -> anyhow::Result<Self> {
        let path = flock_common::paths::config_path(data_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid {}", path.display()))
    }

    pub fn socket_path(&self, data_dir: &Path) -> PathBuf {
        self.daemon
            .socket
            .clone()
            .unwrap_or_else(|| flock_common::paths::socket_path(data_dir))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.shutdown_timeout_secs)
    }
}
