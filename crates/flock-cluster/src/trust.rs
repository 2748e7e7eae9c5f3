//! Trusted client certificates and caller identity.
//!
//! A caller is trusted when it comes over the local unix socket, when its
//! certificate fingerprint is registered here, or when it is a member of
//! the cluster. New certificates are admitted either because the caller
//! is already trusted or because it proves knowledge of the trust
//! password; after that the certificate alone is enough.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use flock_crypto::identity::certificate_der_from_base64;
use flock_crypto::password::verify_password;
use flock_crypto::pinning::{fingerprint_sha256, fingerprints_match};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::protocol::CertificatesPost;

/// Who is making a request, as established by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Same-host admin over the unix socket.
    Local,
    /// TLS client presenting a certificate.
    Remote {
        fingerprint: String,
        certificate: Vec<u8>,
    },
    /// TLS client without a certificate.
    Anonymous,
}

impl PeerIdentity {
    pub fn from_certificate(der: &[u8]) -> Self {
        Self::Remote {
            fingerprint: fingerprint_sha256(der),
            certificate: der.to_vec(),
        }
    }

    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Remote { fingerprint, .. } => Some(fingerprint),
            Self::Local | Self::Anonymous => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    /// Full API access.
    #[default]
    Client,
    /// Read-only metrics scraping; never authorizes cluster operations.
    Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedCertificate {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CertificateType,
    pub fingerprint: String,
    /// Base64 DER.
    pub certificate: String,
    pub added_at: DateTime<Utc>,
}

/// Decide whether `post` may be admitted and build the entry for it.
///
/// Local and already-trusted callers are admitted outright. Anyone else
/// must supply the trust password. When the body carries no certificate
/// the caller's own TLS certificate is registered.
pub fn admit(
    post: &CertificatesPost,
    caller: &PeerIdentity,
    caller_trusted: bool,
    password_hash: Option<&str>,
) -> Result<TrustedCertificate, ClusterError> {
    let password_ok = match password_hash {
        Some(hash) if !post.password.is_empty() => verify_password(&post.password, hash),
        _ => false,
    };
    let privileged = matches!(caller, PeerIdentity::Local) || caller_trusted;
    if !privileged && !password_ok {
        tracing::warn!(
            fingerprint = caller.fingerprint().unwrap_or("-"),
            "Rejected certificate registration"
        );
        return Err(ClusterError::Unauthorized);
    }

    let der = if post.certificate.is_empty() {
        match caller {
            PeerIdentity::Remote { certificate, .. } => certificate.clone(),
            PeerIdentity::Local | PeerIdentity::Anonymous => {
                return Err(ClusterError::InvalidPayload(
                    "no certificate provided".to_string(),
                ))
            }
        }
    } else {
        certificate_der_from_base64(&post.certificate)?
    };

    let fingerprint = fingerprint_sha256(&der);
    let name = if post.name.is_empty() {
        fingerprint[..12].to_string()
    } else {
        post.name.clone()
    };

    Ok(TrustedCertificate {
        name,
        kind: post.kind,
        fingerprint,
        certificate: STANDARD.encode(&der),
        added_at: Utc::now(),
    })
}

/// Registered certificates, persisted to `<data>/state/trust.json`.
pub struct TrustStore {
    path: Option<PathBuf>,
    certificates: Vec<TrustedCertificate>,
}

impl TrustStore {
    pub fn open(path: Option<PathBuf>) -> Result<Self, ClusterError> {
        let certificates = match &path {
            Some(p) => flock_common::persist::read_json_if_exists::<Vec<TrustedCertificate>>(p)?
                .unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(Self { path, certificates })
    }

    /// Whether `fingerprint` belongs to a registered client certificate.
    pub fn is_trusted_client(&self, fingerprint: &str) -> bool {
        self.certificates
            .iter()
            .any(|c| c.kind == CertificateType::Client && fingerprints_match(&c.fingerprint, fingerprint))
    }

    pub fn list(&self) -> &[TrustedCertificate] {
        &self.certificates
    }

    pub fn add(&mut self, certificate: TrustedCertificate) -> Result<(), ClusterError> {
        if self
            .certificates
            .iter()
            .any(|c| c.fingerprint == certificate.fingerprint)
        {
            return Err(ClusterError::Conflict(format!(
                "certificate already trusted: {}",
                certificate.fingerprint
            )));
        }
        let mut next = self.certificates.clone();
        next.push(certificate);
        self.persist(&next)?;
        self.certificates = next;
        Ok(())
    }

    pub fn remove(&mut self, fingerprint: &str) -> Result<TrustedCertificate, ClusterError> {
        let index = self
            .certificates
            .iter()
            .position(|c| c.fingerprint == fingerprint)
            .ok_or_else(|| ClusterError::NotFound(format!("certificate not found: {fingerprint}")))?;
        let mut next = self.certificates.clone();
        let removed = next.remove(index);
        self.persist(&next)?;
        self.certificates = next;
        Ok(removed)
    }

    fn persist(&self, certificates: &[TrustedCertificate]) -> Result<(), ClusterError> {
        if let Some(path) = &self.path {
            flock_common::persist::write_json_pretty(path, &certificates)?;
        }
        Ok(())
    }
}
