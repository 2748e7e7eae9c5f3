//! Daemon TLS identity.
//!
//! Each daemon owns one self-signed ECDSA P-256 certificate. It serves
//! the HTTPS listener with it, presents it as client certificate when
//! calling peers, and is known to the rest of the cluster by its
//! SHA-256 fingerprint.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{CertificateParams, DnType, KeyPair};

use crate::pinning::fingerprint_sha256;

const CERT_FILENAME: &str = "server.crt";
const KEY_FILENAME: &str = "server.key";
const CERT_PEM_TAG: &str = "CERTIFICATE";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A daemon's certificate and private key.
#[derive(Clone)]
pub struct ServerIdentity {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
    fingerprint: String,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    /// Generate a fresh self-signed identity for `server_name`.
    pub fn generate(server_name: &str) -> Result<Self, IdentityError> {
        let key = KeyPair::generate().map_err(|e| IdentityError::Generate(e.to_string()))?;
        let mut params = CertificateParams::new(vec![server_name.to_string()])
            .map_err(|e| IdentityError::Generate(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("flock@{server_name}"));
        params
            .distinguished_name
            .push(DnType::OrganizationName, "flock");

        // rcgen 0.13: params consumed, key by ref
        let cert = params
            .self_signed(&key)
            .map_err(|e| IdentityError::Generate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            fingerprint: fingerprint_sha256(cert.der()),
            cert_der: cert.der().to_vec(),
        })
    }

    /// Rebuild an identity from PEM-encoded certificate and PKCS#8 key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, IdentityError> {
        let cert_der = certificate_der_from_pem(cert_pem)?;
        KeyPair::from_pem(key_pem).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            fingerprint: fingerprint_sha256(&cert_der),
            cert_der,
        })
    }

    /// Load `server.crt`/`server.key` from `dir`, generating and saving
    /// them on first start.
    pub fn load_or_generate(dir: &Path, server_name: &str) -> Result<Self, IdentityError> {
        let cert_path = dir.join(CERT_FILENAME);
        let key_path = dir.join(KEY_FILENAME);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let identity = Self::from_pem(&cert_pem, &key_pem)?;
            tracing::debug!(fingerprint = %identity.fingerprint, "Loaded server identity");
            return Ok(identity);
        }

        let identity = Self::generate(server_name)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(&cert_path, &identity.cert_pem)?;
        write_private(&key_path, &identity.key_pem)?;
        tracing::info!(
            fingerprint = %identity.fingerprint,
            path = %cert_path.display(),
            "Generated server identity"
        );
        Ok(identity)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PKCS#8 DER of the private key.
    pub fn key_der(&self) -> Result<Vec<u8>, IdentityError> {
        let parsed = pem::parse(&self.key_pem)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(parsed.contents().to_vec())
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Base64 DER of the certificate, the form used by trust registration.
    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(&self.cert_der)
    }
}

/// Extract the DER bytes of a PEM `CERTIFICATE` block.
pub fn certificate_der_from_pem(cert_pem: &str) -> Result<Vec<u8>, IdentityError> {
    let parsed =
        pem::parse(cert_pem).map_err(|e| IdentityError::InvalidCertificate(e.to_string()))?;
    if parsed.tag() != CERT_PEM_TAG {
        return Err(IdentityError::InvalidCertificate(format!(
            "expected {CERT_PEM_TAG} block, found {}",
            parsed.tag()
        )));
    }
    Ok(parsed.contents().to_vec())
}

/// Decode a base64 DER certificate.
pub fn certificate_der_from_base64(encoded: &str) -> Result<Vec<u8>, IdentityError> {
    let der = STANDARD
        .decode(encoded.trim())
        .map_err(|e| IdentityError::InvalidCertificate(e.to_string()))?;
    if der.is_empty() {
        return Err(IdentityError::InvalidCertificate(
            "empty certificate".to_string(),
        ));
    }
    Ok(der)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<(), std::io::Error> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<(), std::io::Error> {
    std::fs::write(path, contents)
}
