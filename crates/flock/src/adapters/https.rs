//! Network adapter: the REST router over mutual TLS.
//!
//! Every client certificate is accepted during the handshake; the
//! router authorizes per request by fingerprint. The listener follows
//! `core.https_address` and is restarted whenever that key changes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use flock_cluster::config::HTTPS_ADDRESS;
use flock_cluster::trust::PeerIdentity;
use flock_cluster::{ClusterCore, ClusterEvent};
use flock_crypto::identity::ServerIdentity;
use futures_util::future::BoxFuture;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tower_http::add_extension::AddExtension;

/// Grace period for in-flight requests when the listener is replaced.
const RESTART_GRACE: Duration = Duration::from_secs(5);

// ── TLS ─────────────────────────────────────────────────────────────

/// Requests a client certificate but accepts any (or none).
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
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

pub fn server_config(identity: &ServerIdentity) -> anyhow::Result<ServerConfig> {
    let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = AcceptAnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    };
    let cert = CertificateDer::from(identity.cert_der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der()?));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Caller identity from the handshake's client certificate chain.
fn peer_identity(certificates: Option<&[CertificateDer<'static>]>) -> PeerIdentity {
    match certificates.and_then(|chain| chain.first()) {
        Some(leaf) => PeerIdentity::from_certificate(leaf.as_ref()),
        None => PeerIdentity::Anonymous,
    }
}

/// TLS acceptor that tags each connection's requests with the caller.
#[derive(Clone)]
struct IdentityAcceptor {
    inner: RustlsAcceptor,
}

impl<I, S> Accept<I, S> for IdentityAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let identity = peer_identity(stream.get_ref().1.peer_certificates());
            Ok((stream, AddExtension::new(service, identity)))
        })
    }
}

// ── Listener ────────────────────────────────────────────────────────

async fn serve(address: SocketAddr, router: Router, tls: RustlsConfig, handle: Handle) -> io::Result<()> {
    let acceptor = IdentityAcceptor {
        inner: RustlsAcceptor::new(tls),
    };
    axum_server::bind(address)
        .acceptor(acceptor)
        .handle(handle)
        .serve(router.into_make_service())
        .await
}

/// Run the HTTPS listener for as long as `cancel` is live, rebinding
/// whenever `core.https_address` changes.
pub async fn supervise(core: ClusterCore, cancel: CancellationToken) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_config(Arc::new(server_config(core.identity())?));
    let router = core.routes();
    let mut events = core.subscribe();
    let mut current: Option<Handle> = None;

    loop {
        if let Some(handle) = current.take() {
            handle.graceful_shutdown(Some(RESTART_GRACE));
        }
        if let Some(address) = core.https_address().await {
            match address.parse::<SocketAddr>() {
                Ok(addr) => {
                    let handle = Handle::new();
                    let (router, tls, h) = (router.clone(), tls.clone(), handle.clone());
                    tokio::spawn(async move {
                        if let Err(e) = serve(addr, router, tls, h).await {
                            tracing::error!(error = %e, address = %addr, "HTTPS listener failed");
                        }
                    });
                    tracing::info!(address = %addr, fingerprint = %core.fingerprint(), "HTTPS listener started");
                    current = Some(handle);
                }
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "Not listening: address is not ip:port");
                }
            }
        } else {
            tracing::info!("HTTPS listener disabled (core.https_address unset)");
        }

        // Wait for a change of address or shutdown.
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ClusterEvent::ConfigChanged { keys }) if keys.iter().any(|k| k == HTTPS_ADDRESS) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "Event receiver lagged");
                        break;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = cancel.cancelled() => {
                    if let Some(handle) = current.take() {
                        handle.graceful_shutdown(Some(RESTART_GRACE));
                    }
                    tracing::debug!("HTTPS listener stopped");
                    return Ok(());
                }
            }
        }
    }
}
