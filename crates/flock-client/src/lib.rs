//! Admin client for a running flock daemon.
//!
//! Talks HTTP/1.1 over the daemon's unix socket, where every caller is
//! trusted. One connection per request; the daemon is local and requests
//! are infrequent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use flock_cluster::operation::OperationView;
use flock_cluster::protocol::{
    CertificatesPost, ClusterMemberPost, ClusterPut, ClusterView, ImageView, ImagesPost,
    MemberView, ServerPut, ServerView,
};
use flock_cluster::trust::TrustedCertificate;
use flock_common::api::ErrorBody;
use flock_common::error::ErrorCode;
use flock_common::http::{ETAG_HEADER, IF_MATCH_HEADER};
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;

/// Connect timeout for the unix socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for ordinary (non-waiting) requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Error types ───────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon not reachable: {0}")]
    Unreachable(String),

    #[error("{message}")]
    Api { error: ErrorCode, message: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A decoded response: status, ETag header and body bytes.
struct Reply {
    status: StatusCode,
    etag: Option<String>,
    body: Bytes,
}

impl Reply {
    fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

// ── Client ────────────────────────────────────────────────────────

pub struct ClusterClient {
    socket: PathBuf,
}

impl ClusterClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    // ── Server ────────────────────────────────────────────────────

    /// `GET /1.0`: the server view and its ETag.
    pub async fn server(&self) -> Result<(ServerView, String)> {
        let reply = self.send::<()>(Method::GET, "/1.0", None, None).await?;
        let view = reply.json()?;
        Ok((view, reply.etag.unwrap_or_default()))
    }

    /// `PUT /1.0`, replacing the whole config.
    pub async fn update_server(&self, put: &ServerPut, if_match: Option<&str>) -> Result<()> {
        self.send(Method::PUT, "/1.0", Some(put), if_match).await?;
        Ok(())
    }

    // ── Cluster ───────────────────────────────────────────────────

    pub async fn cluster(&self) -> Result<ClusterView> {
        self.get_json("/1.0/cluster").await
    }

    /// `PUT /1.0/cluster`. Returns the bootstrap or join operation.
    pub async fn update_cluster(&self, put: &ClusterPut) -> Result<OperationView> {
        self.send(Method::PUT, "/1.0/cluster", Some(put), None)
            .await?
            .json()
    }

    pub async fn member_urls(&self) -> Result<Vec<String>> {
        self.get_json("/1.0/cluster/members").await
    }

    pub async fn members(&self) -> Result<Vec<MemberView>> {
        self.get_json("/1.0/cluster/members?recursion=1").await
    }

    pub async fn member(&self, name: &str) -> Result<MemberView> {
        self.get_json(&format!("/1.0/cluster/members/{name}")).await
    }

    pub async fn rename_member(&self, name: &str, new_name: &str) -> Result<()> {
        let post = ClusterMemberPost {
            server_name: new_name.to_string(),
        };
        self.send(
            Method::POST,
            &format!("/1.0/cluster/members/{name}"),
            Some(&post),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, name: &str, force: bool) -> Result<()> {
        let path = if force {
            format!("/1.0/cluster/members/{name}?force=1")
        } else {
            format!("/1.0/cluster/members/{name}")
        };
        self.send::<()>(Method::DELETE, &path, None, None).await?;
        Ok(())
    }

    // ── Certificates ──────────────────────────────────────────────

    pub async fn certificates(&self) -> Result<Vec<TrustedCertificate>> {
        self.get_json("/1.0/certificates").await
    }

    pub async fn add_certificate(&self, post: &CertificatesPost) -> Result<TrustedCertificate> {
        self.send(Method::POST, "/1.0/certificates", Some(post), None)
            .await?
            .json()
    }

    pub async fn remove_certificate(&self, fingerprint: &str) -> Result<()> {
        self.send::<()>(
            Method::DELETE,
            &format!("/1.0/certificates/{fingerprint}"),
            None,
            None,
        )
        .await?;
        Ok(())
    }

    // ── Images ────────────────────────────────────────────────────

    pub async fn images(&self) -> Result<Vec<ImageView>> {
        self.get_json("/1.0/images").await
    }

    pub async fn add_image(&self, fingerprint: &str) -> Result<()> {
        let post = ImagesPost {
            fingerprint: fingerprint.to_string(),
        };
        self.send(Method::POST, "/1.0/images", Some(&post), None).await?;
        Ok(())
    }

    pub async fn remove_image(&self, fingerprint: &str) -> Result<()> {
        self.send::<()>(Method::DELETE, &format!("/1.0/images/{fingerprint}"), None, None)
            .await?;
        Ok(())
    }

    // ── Operations ────────────────────────────────────────────────

    pub async fn operations(&self) -> Result<Vec<OperationView>> {
        self.get_json("/1.0/operations").await
    }

    pub async fn operation(&self, id: &str) -> Result<OperationView> {
        self.get_json(&format!("/1.0/operations/{id}")).await
    }

    /// Block until operation `id` finishes and return its final view.
    pub async fn wait_operation(&self, id: &str) -> Result<OperationView> {
        let reply = self
            .request::<()>(Method::GET, &format!("/1.0/operations/{id}/wait"), None, None)
            .await?;
        check_status(&reply)?;
        reply.json()
    }

    /// Wait for `op` and turn a failed outcome into [`ClientError::Api`].
    pub async fn wait_success(&self, op: &OperationView) -> Result<OperationView> {
        let done = self.wait_operation(&op.id).await?;
        match done.error_code {
            Some(error) => Err(ClientError::Api {
                error,
                message: done.err,
            }),
            None => Ok(done),
        }
    }

    pub async fn cancel_operation(&self, id: &str) -> Result<()> {
        self.send::<()>(Method::DELETE, &format!("/1.0/operations/{id}"), None, None)
            .await?;
        Ok(())
    }

    // ── Plumbing ──────────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send::<()>(Method::GET, path, None, None).await?.json()
    }

    /// Bounded request that maps non-2xx replies to [`ClientError::Api`].
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        if_match: Option<&str>,
    ) -> Result<Reply> {
        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.request(method, path, body, if_match))
            .await
            .map_err(|_| ClientError::Transport(format!("{path}: request timed out")))??;
        check_status(&reply)?;
        Ok(reply)
    }

    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        if_match: Option<&str>,
    ) -> Result<Reply> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| ClientError::Unreachable(format!("{}: connect timed out", self.socket.display())))?
            .map_err(|e| ClientError::Unreachable(format!("{}: {e}", self.socket.display())))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Admin connection closed with error");
            }
        });

        let payload = match body {
            Some(body) => {
                Bytes::from(serde_json::to_vec(body).map_err(|e| ClientError::Decode(e.to_string()))?)
            }
            None => Bytes::new(),
        };
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "flock");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        if let Some(etag) = if_match {
            builder = builder.header(IF_MATCH_HEADER, etag);
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .to_bytes();

        Ok(Reply { status, etag, body })
    }
}

fn check_status(reply: &Reply) -> Result<()> {
    if reply.status.is_success() {
        return Ok(());
    }
    match serde_json::from_slice::<ErrorBody>(&reply.body) {
        Ok(body) => Err(ClientError::Api {
            error: body.error,
            message: body.message,
        }),
        Err(_) => Err(ClientError::Transport(format!(
            "unexpected status {}",
            reply.status
        ))),
    }
}
