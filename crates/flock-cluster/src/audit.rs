//! Append-only audit log for membership changes.
//!
//! One line per event: `2026-10-19T10:30:00Z | member_joined | name=node2 | id=2`

use std::io::Write;
use std::path::Path;

use chrono::Utc;

pub const AUDIT_FILENAME: &str = "cluster-audit.log";

/// Append an entry to the log at `path`, creating parent directories.
pub fn append_entry_to(
    path: &Path,
    event: &str,
    fields: &[(&str, &str)],
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut line = format!("{} | {event}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
    for (key, value) in fields {
        line.push_str(" | ");
        line.push_str(key);
        line.push('=');
        line.push_str(value);
    }
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;

    tracing::debug!(event, "Audit entry written");
    Ok(())
}
