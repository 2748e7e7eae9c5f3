//! Client command handlers. Every command talks to the running daemon
//! over its admin socket.

pub mod cluster;
pub mod config;
pub mod trust;

use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flock_client::{ClientError, ClusterClient};
use serde::Serialize;

/// Turn "daemon not running" into an actionable message.
pub(crate) fn explain(e: ClientError) -> anyhow::Error {
    match e {
        ClientError::Unreachable(detail) => anyhow::anyhow!(
            "No running flock daemon found ({detail}).\n\
             Start it first: flock daemon"
        ),
        other => other.into(),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read a PEM certificate file.
pub(crate) fn read_pem(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Base64 DER of a PEM certificate, the form the certificates API takes.
pub(crate) fn pem_to_base64(pem: &str) -> anyhow::Result<String> {
    let der = flock_crypto::identity::certificate_der_from_pem(pem)?;
    Ok(STANDARD.encode(der))
}

pub(crate) fn client(socket: &Path) -> ClusterClient {
    ClusterClient::new(socket)
}
