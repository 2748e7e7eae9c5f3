use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FLOCK_DATA_DIR";

/// Root data directory for flock.
///
/// Identity, replicated node table, trust store and logs all live here.
///
/// - `$FLOCK_DATA_DIR` when set
/// - Linux/macOS: `~/.flock/`
/// - Windows: `%LOCALAPPDATA%\flock\`
pub fn flock_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("flock");
        }
    }

    #[cfg(not(windows))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".flock");
        }
    }

    // Fallback
    PathBuf::from(".flock")
}

/// Runtime state directory (node table, server config, trust store).
pub fn state_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("state")
}

/// Log directory (audit log, optional daemon log).
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Unix admin socket path.
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("unix.socket")
}

/// Daemon configuration file.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}
