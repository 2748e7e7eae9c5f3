//! Peer transport over HTTPS with mutual TLS.
//!
//! The daemon presents its own certificate as client identity. The
//! server side is not validated against any CA: the certificate must
//! hash to the fingerprint recorded for the target member (or supplied
//! by the operator when joining).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use flock_common::api::ErrorBody;
use flock_crypto::identity::ServerIdentity;
use flock_crypto::pinning::{fingerprint_sha256, fingerprints_match};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::ClusterError;
use crate::transport::{InternalRequest, InternalResponse, PeerTarget, PeerTransport, TransportError};

/// Accepts exactly one server certificate, identified by its SHA-256.
#[derive(Debug)]
struct PinnedServerVerifier {
    fingerprint: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint_sha256(end_entity.as_ref());
        if fingerprints_match(&presented, &self.fingerprint) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate {presented} does not match pinned {}",
                self.fingerprint
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Production [`PeerTransport`]: one reqwest client per pinned fingerprint.
pub struct HttpsTransport {
    identity: ServerIdentity,
    timeout: Duration,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpsTransport {
    pub fn new(identity: ServerIdentity, timeout: Duration) -> Self {
        Self {
            identity,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, fingerprint: &str) -> Result<reqwest::Client, ClusterError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(fingerprint) {
            return Ok(client.clone());
        }

        let tls = self.tls_config(fingerprint)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ClusterError::Internal(format!("building peer client: {e}")))?;
        clients.insert(fingerprint.to_string(), client.clone());
        Ok(client)
    }

    fn tls_config(&self, fingerprint: &str) -> Result<ClientConfig, ClusterError> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinnedServerVerifier {
            fingerprint: fingerprint.to_string(),
            algorithms: provider.signature_verification_algorithms,
        };
        let cert = CertificateDer::from(self.identity.cert_der().to_vec());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.identity.key_der()?));

        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClusterError::Crypto(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(vec![cert], key)
            .map_err(|e| ClusterError::Crypto(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for HttpsTransport {
    async fn send(
        &self,
        target: &PeerTarget,
        request: InternalRequest,
    ) -> Result<InternalResponse, TransportError> {
        let client = self
            .client_for(&target.fingerprint)
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let url = format!("https://{}{}", target.address, request.path());
        tracing::debug!(peer = %target.address, request = request.name(), "Sending internal request");

        let response = client.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(target.address.clone())
            } else {
                TransportError::Unreachable(format!("{}: {e}", target.address))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body: ErrorBody = response
                .json()
                .await
                .map_err(|e| TransportError::Decode(format!("{status}: {e}")))?;
            return Err(TransportError::Api {
                code: body.error,
                message: body.message,
            });
        }

        response
            .json::<InternalResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn retain_peers(&self, keep: &[String]) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|fingerprint, _| keep.contains(fingerprint));
        if clients.len() < before {
            tracing::debug!(dropped = before - clients.len(), "Dropped clients of departed peers");
        }
    }
}
