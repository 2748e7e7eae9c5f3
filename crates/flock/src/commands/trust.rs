//! `flock trust ...`

use std::path::Path;

use flock_cluster::protocol::CertificatesPost;
use flock_cluster::trust::CertificateType;

use super::{client, explain, pem_to_base64, print_json, read_pem};
use crate::format;

pub async fn add(socket: &Path, certificate: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let post = CertificatesPost {
        name: name.unwrap_or_default().to_string(),
        kind: CertificateType::Client,
        certificate: pem_to_base64(&read_pem(certificate)?)?,
        password: String::new(),
    };
    let entry = client(socket).add_certificate(&post).await.map_err(explain)?;
    if json {
        return print_json(&entry);
    }
    println!("Trusted {} ({})", entry.name, entry.fingerprint);
    Ok(())
}

pub async fn list(socket: &Path, json: bool) -> anyhow::Result<()> {
    let certificates = client(socket).certificates().await.map_err(explain)?;
    if json {
        return print_json(&certificates);
    }
    format::certificate_table(&certificates);
    Ok(())
}

pub async fn remove(socket: &Path, fingerprint: &str, json: bool) -> anyhow::Result<()> {
    client(socket)
        .remove_certificate(fingerprint)
        .await
        .map_err(explain)?;
    if json {
        return print_json(&serde_json::json!({ "removed": fingerprint }));
    }
    println!("Removed {fingerprint}");
    Ok(())
}
