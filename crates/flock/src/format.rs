//! Human-readable CLI output. `--json` output bypasses this module.

use std::collections::BTreeMap;

use flock_cluster::operation::OperationView;
use flock_cluster::protocol::{ClusterView, MemberView, ServerView};
use flock_cluster::trust::TrustedCertificate;

/// Print the member table.
///
/// Format: `NAME\tID\tADDRESS\tROLE\tSTATUS\tMESSAGE`
pub fn member_table(members: &[MemberView]) {
    for line in member_lines(members) {
        println!("{line}");
    }
}

fn member_lines(members: &[MemberView]) -> Vec<String> {
    members
        .iter()
        .map(|m| {
            format!(
                "{}\t{}\t{}\t{:?}\t{:?}\t{}",
                m.server_name, m.id, m.address, m.role, m.status, m.message
            )
        })
        .collect()
}

pub fn cluster_summary(view: &ClusterView, server: &ServerView) {
    if view.enabled {
        println!("Clustered as {}", view.server_name);
    } else {
        println!("Not clustered");
    }
    if let Some(address) = server.environment.addresses.first() {
        println!("  Address:     {address}");
    }
    println!(
        "  Fingerprint: {}",
        server.environment.certificate_fingerprint
    );
}

pub fn config_table(config: &BTreeMap<String, String>) {
    if config.is_empty() {
        println!("No configuration set.");
        return;
    }
    for (key, value) in config {
        println!("{key} = {value}");
    }
}

pub fn certificate_table(certificates: &[TrustedCertificate]) {
    if certificates.is_empty() {
        println!("No trusted certificates.");
        return;
    }
    for cert in certificates {
        println!(
            "{}\t{:?}\t{}\t{}",
            cert.name,
            cert.kind,
            cert.fingerprint,
            cert.added_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

pub fn operation_done(op: &OperationView, what: &str) {
    println!("{what} ({:?}, operation {})", op.status, op.id);
}
