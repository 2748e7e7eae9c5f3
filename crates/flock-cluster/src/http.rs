//! REST handlers for `/1.0/...` and the member-to-member `/internal/...` API.
//!
//! The same router is served on the unix socket and over HTTPS. The
//! listener stores the caller's [`PeerIdentity`] in request extensions;
//! handlers read it through the [`Caller`] extractor.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flock_common::api::operation_url;
use flock_common::http::{error_response, ETAG_HEADER, IF_MATCH_HEADER};
use serde::Deserialize;
use serde_json::json;

use crate::error::ClusterError;
use crate::operation::Operation;
use crate::protocol::{CertificatesPost, ClusterMemberPost, ClusterPut, ImagesPost, ServerPut};
use crate::transport::{InternalRequest, InternalResponse};
use crate::trust::PeerIdentity;
use crate::CoreState;

type AppState = State<Arc<CoreState>>;

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let code = self.code();
        if code.http_status() >= 500 {
            tracing::error!(error = %self, "Request failed");
        }
        error_response(code, self.to_string())
    }
}

/// The caller as established by the listener; anonymous when absent.
pub(crate) struct Caller(pub(crate) PeerIdentity);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(
            parts
                .extensions
                .get::<PeerIdentity>()
                .cloned()
                .unwrap_or(PeerIdentity::Anonymous),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecursionQuery {
    recursion: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct ForceQuery {
    force: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    /// Seconds; absent waits until the operation finishes.
    timeout: Option<u64>,
}

/// Build the router over shared core state.
pub(crate) fn routes(state: Arc<CoreState>) -> Router {
    Router::new()
        .route("/1.0", get(get_server).put(put_server))
        .route("/1.0/cluster", get(get_cluster).put(put_cluster))
        .route("/1.0/cluster/members", get(list_members))
        .route(
            "/1.0/cluster/members/:name",
            get(get_member).post(rename_member).delete(delete_member),
        )
        .route("/1.0/certificates", get(list_certificates).post(add_certificate))
        .route("/1.0/certificates/:fingerprint", axum::routing::delete(remove_certificate))
        .route("/1.0/images", get(list_images).post(add_image))
        .route("/1.0/images/:fingerprint", axum::routing::delete(remove_image))
        .route("/1.0/operations", get(list_operations))
        .route("/1.0/operations/:id", get(get_operation).delete(cancel_operation))
        .route("/1.0/operations/:id/wait", get(wait_operation))
        .route("/internal/cluster/accept", post(internal))
        .route("/internal/cluster/mutate", post(internal))
        .route("/internal/cluster/replicate", post(internal))
        .route("/internal/cluster/heartbeat", post(internal))
        .route("/internal/cluster/ping", post(internal))
        .route("/internal/config/notify", post(internal))
        .with_state(state)
}

async fn require_trusted(state: &CoreState, caller: &PeerIdentity) -> Result<(), ClusterError> {
    if state.is_trusted_caller(caller).await {
        Ok(())
    } else {
        Err(ClusterError::Unauthorized)
    }
}

fn if_match(headers: &HeaderMap) -> Option<&str> {
    headers.get(IF_MATCH_HEADER).and_then(|v| v.to_str().ok())
}

/// 202 with the operation and its `Location`.
fn accepted(op: &Operation) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, operation_url(op.id()))],
        Json(op.view()),
    )
        .into_response()
}

fn empty() -> Json<serde_json::Value> {
    Json(json!({}))
}

// ── Server ──────────────────────────────────────────────────────────

/// GET /1.0. Untrusted callers get the environment only.
async fn get_server(State(state): AppState, Caller(caller): Caller) -> Result<Response, ClusterError> {
    let trusted = state.is_trusted_caller(&caller).await;
    let (view, etag) = state.server_view(trusted).await?;
    Ok(([(ETAG_HEADER, etag)], Json(view)).into_response())
}

async fn put_server(
    State(state): AppState,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(put): Json<ServerPut>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.update_server(put, if_match(&headers)).await?;
    Ok(empty())
}

// ── Cluster ─────────────────────────────────────────────────────────

async fn get_cluster(State(state): AppState, Caller(caller): Caller) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let view = state.cluster_view().await;
    let etag = flock_common::etag::etag_hash(&view)?;
    Ok(([(ETAG_HEADER, etag)], Json(view)).into_response())
}

/// PUT /1.0/cluster: bootstrap or join, as an operation.
async fn put_cluster(
    State(state): AppState,
    Caller(caller): Caller,
    headers: HeaderMap,
    Json(put): Json<ClusterPut>,
) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let op = state.update_cluster(put, if_match(&headers)).await?;
    Ok(accepted(&op))
}

async fn list_members(
    State(state): AppState,
    Caller(caller): Caller,
    Query(query): Query<RecursionQuery>,
) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let members = state.member_views().await;
    if query.recursion.unwrap_or(0) >= 1 {
        return Ok(Json(members).into_response());
    }
    let urls: Vec<String> = members.into_iter().map(|m| m.url).collect();
    Ok(Json(urls).into_response())
}

async fn get_member(
    State(state): AppState,
    Caller(caller): Caller,
    Path(name): Path<String>,
) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    Ok(Json(state.member_view_by_name(&name).await?).into_response())
}

async fn rename_member(
    State(state): AppState,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Json(post): Json<ClusterMemberPost>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.rename_member(&name, post).await?;
    Ok(empty())
}

async fn delete_member(
    State(state): AppState,
    Caller(caller): Caller,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.delete_member(&name, query.force.unwrap_or(0) == 1).await?;
    Ok(empty())
}

// ── Certificates ────────────────────────────────────────────────────

async fn list_certificates(State(state): AppState, Caller(caller): Caller) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let certificates = state.trust.lock().await.list().to_vec();
    Ok(Json(certificates).into_response())
}

/// POST /1.0/certificates. Open to untrusted callers, who must send the
/// trust password.
async fn add_certificate(
    State(state): AppState,
    Caller(caller): Caller,
    Json(post): Json<CertificatesPost>,
) -> Result<Response, ClusterError> {
    let entry = state.register_certificate(post, &caller).await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn remove_certificate(
    State(state): AppState,
    Caller(caller): Caller,
    Path(fingerprint): Path<String>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.remove_certificate(&fingerprint).await?;
    Ok(empty())
}

// ── Images ──────────────────────────────────────────────────────────

async fn list_images(State(state): AppState, Caller(caller): Caller) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    Ok(Json(state.image_views().await).into_response())
}

async fn add_image(
    State(state): AppState,
    Caller(caller): Caller,
    Json(post): Json<ImagesPost>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.associate_resource(&post.fingerprint).await?;
    Ok(empty())
}

async fn remove_image(
    State(state): AppState,
    Caller(caller): Caller,
    Path(fingerprint): Path<String>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.disassociate_resource(&fingerprint).await?;
    Ok(empty())
}

// ── Operations ──────────────────────────────────────────────────────

async fn list_operations(State(state): AppState, Caller(caller): Caller) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let views: Vec<_> = state.operations.list().iter().map(Operation::view).collect();
    Ok(Json(views).into_response())
}

async fn get_operation(
    State(state): AppState,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    Ok(Json(state.operation(&id)?.view()).into_response())
}

async fn cancel_operation(
    State(state): AppState,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ClusterError> {
    require_trusted(&state, &caller).await?;
    state.operation(&id)?.cancel()?;
    Ok(empty())
}

/// GET /1.0/operations/:id/wait. Returns the view once finished or when
/// the timeout expires, whichever comes first.
async fn wait_operation(
    State(state): AppState,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Response, ClusterError> {
    require_trusted(&state, &caller).await?;
    let op = state.operation(&id)?;
    // Failures are reported through the view.
    match query.timeout {
        Some(secs) => {
            let _ = op.wait_timeout(Duration::from_secs(secs)).await;
        }
        None => {
            let _ = op.wait().await;
        }
    }
    Ok(Json(op.view()).into_response())
}

// ── Internal ────────────────────────────────────────────────────────

async fn internal(
    State(state): AppState,
    Caller(caller): Caller,
    uri: Uri,
    Json(request): Json<InternalRequest>,
) -> Result<Json<InternalResponse>, ClusterError> {
    if uri.path() != request.path() {
        return Err(ClusterError::InvalidPayload(format!(
            "{} request sent to {}",
            request.name(),
            uri.path()
        )));
    }
    state.handle_internal(&caller, request).await.map(Json)
}
