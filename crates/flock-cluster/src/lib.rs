//! Flock Cluster: membership and coordination core.
//!
//! Bootstraps the first member, admits joining members after certificate
//! authorization, removes members (checking which shared images only they
//! hold), renames them, and keeps every member's copy of the node table and
//! of the cluster-wide server config in step. Long-running actions run as
//! [`operation::Operation`]s that callers can wait on or cancel.

pub mod audit;
pub mod config;
mod coordinator;
pub mod error;
mod http;
pub mod https;
pub mod local;
pub mod member;
pub mod mutation;
pub mod notify;
pub mod operation;
pub mod protocol;
pub mod resources;
pub mod settings;
pub mod store;
pub mod transport;
pub mod trust;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use axum::Router;
use flock_crypto::identity::ServerIdentity;
use tokio::sync::{broadcast, Mutex};

pub use error::ClusterError;

use config::ServerConfig;
use notify::{BroadcastReport, NotificationBroadcaster};
use operation::{Operation, OperationRunner, OperationView};
use protocol::{
    CertificatesPost, ClusterMemberPost, ClusterPut, ClusterView, ImageView, MemberView, ServerPut,
    ServerView,
};
use settings::ClusterSettings;
use store::MembershipStore;
use transport::{InternalRequest, InternalResponse, PeerTransport};
use trust::{PeerIdentity, TrustStore, TrustedCertificate};

/// Capacity for the cluster event broadcast channel.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

const CLUSTER_FILENAME: &str = "cluster.json";
const CONFIG_FILENAME: &str = "config.json";
const TRUST_FILENAME: &str = "trust.json";

/// Events emitted when membership or configuration changes.
///
/// Membership events are emitted on the member that committed the change.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Bootstrapped { server_name: String },
    /// This daemon joined an existing cluster.
    Joined { server_name: String },
    MemberJoined { server_name: String, id: i64 },
    MemberRenamed { from: String, to: String },
    MemberRemoved { server_name: String, deleted: Vec<String> },
    /// This daemon is no longer a member.
    LeftCluster,
    ConfigChanged { keys: Vec<String> },
}

/// How to build a [`ClusterCore`].
#[derive(Debug, Clone)]
pub struct ClusterCoreConfig {
    pub identity: ServerIdentity,
    /// Root of persisted state. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub settings: ClusterSettings,
}

// ── Internal shared state ───────────────────────────────────────────

/// Shared state behind [`ClusterCore`] and the HTTP handlers.
pub(crate) struct CoreState {
    pub(crate) identity: ServerIdentity,
    pub(crate) settings: ClusterSettings,
    pub(crate) store: MembershipStore,
    pub(crate) trust: Mutex<TrustStore>,
    pub(crate) config: Mutex<ServerConfig>,
    pub(crate) operations: OperationRunner,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) notifier: NotificationBroadcaster,
    pub(crate) audit_path: Option<PathBuf>,
    pub(crate) event_tx: broadcast::Sender<ClusterEvent>,
    /// Held by bootstrap and join for their whole run.
    pub(crate) membership_change: Mutex<()>,
}

// ── ClusterCore: domain facade ──────────────────────────────────────

/// The cluster domain facade.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ClusterCore {
    state: Arc<CoreState>,
}

/// Non-owning handle, upgraded on use.
#[derive(Clone)]
pub struct WeakClusterCore {
    state: Weak<CoreState>,
}

impl WeakClusterCore {
    pub fn upgrade(&self) -> Option<ClusterCore> {
        self.state.upgrade().map(|state| ClusterCore { state })
    }
}

impl ClusterCore {
    /// Open (or create) the core's persisted state and wire it to `transport`.
    pub fn open(config: ClusterCoreConfig, transport: Arc<dyn PeerTransport>) -> Result<Self, ClusterError> {
        let state_dir = config.data_dir.as_deref().map(flock_common::paths::state_dir);
        let file = |name: &str| state_dir.as_ref().map(|dir| dir.join(name));

        let store = MembershipStore::open(file(CLUSTER_FILENAME))?;
        let trust = TrustStore::open(file(TRUST_FILENAME))?;
        let server_config = ServerConfig::open(file(CONFIG_FILENAME))?;
        let audit_path = config
            .data_dir
            .as_deref()
            .map(|dir| flock_common::paths::log_dir(dir).join(audit::AUDIT_FILENAME));

        let settings = config.settings;
        let notifier = NotificationBroadcaster::new(
            Arc::clone(&transport),
            settings.notify_timeout(),
            settings.notify_concurrency,
        );

        Ok(Self {
            state: Arc::new(CoreState {
                identity: config.identity,
                operations: OperationRunner::new(settings.operation_retention()),
                settings,
                store,
                trust: Mutex::new(trust),
                config: Mutex::new(server_config),
                transport,
                notifier,
                audit_path,
                event_tx: broadcast::channel(BROADCAST_CHANNEL_CAPACITY).0,
                membership_change: Mutex::new(()),
            }),
        })
    }

    /// Build the REST router (`/1.0/...` and `/internal/...`).
    ///
    /// Handlers read the caller's [`PeerIdentity`] from request extensions;
    /// requests without one are treated as anonymous.
    pub fn routes(&self) -> Router {
        http::routes(Arc::clone(&self.state))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.state.event_tx.subscribe()
    }

    pub fn downgrade(&self) -> WeakClusterCore {
        WeakClusterCore {
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.state.identity
    }

    pub fn fingerprint(&self) -> &str {
        self.state.identity.fingerprint()
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.state.settings
    }

    pub async fn is_clustered(&self) -> bool {
        self.state.is_clustered().await
    }

    /// The node-local `core.https_address`, if configured.
    pub async fn https_address(&self) -> Option<String> {
        self.state.config.lock().await.https_address().map(str::to_string)
    }

    // ── Cluster ─────────────────────────────────────────────────────

    /// Bootstrap or join, depending on `put.cluster_address`.
    pub async fn update_cluster(&self, put: ClusterPut, etag: Option<&str>) -> Result<Operation, ClusterError> {
        self.state.update_cluster(put, etag).await
    }

    pub async fn get_cluster(&self) -> ClusterView {
        self.state.cluster_view().await
    }

    pub async fn get_cluster_members(&self) -> Vec<MemberView> {
        self.state.member_views().await
    }

    pub async fn get_cluster_member_names(&self) -> Vec<String> {
        self.state
            .member_views()
            .await
            .into_iter()
            .map(|m| m.url)
            .collect()
    }

    pub async fn get_cluster_member(&self, name: &str) -> Result<MemberView, ClusterError> {
        self.state.member_view_by_name(name).await
    }

    pub async fn rename_cluster_member(&self, name: &str, post: ClusterMemberPost) -> Result<(), ClusterError> {
        self.state.rename_member(name, post).await
    }

    pub async fn delete_cluster_member(&self, name: &str, force: bool) -> Result<(), ClusterError> {
        self.state.delete_member(name, force).await
    }

    // ── Trust ───────────────────────────────────────────────────────

    pub async fn register_certificate(
        &self,
        post: CertificatesPost,
        caller: &PeerIdentity,
    ) -> Result<TrustedCertificate, ClusterError> {
        self.state.register_certificate(post, caller).await
    }

    pub async fn list_certificates(&self) -> Vec<TrustedCertificate> {
        self.state.trust.lock().await.list().to_vec()
    }

    pub async fn remove_certificate(&self, fingerprint: &str) -> Result<(), ClusterError> {
        self.state.remove_certificate(fingerprint).await
    }

    /// Registered client certificate, or the certificate of a member.
    pub async fn is_authorized(&self, fingerprint: &str) -> bool {
        self.state.is_authorized(fingerprint).await
    }

    // ── Server config ───────────────────────────────────────────────

    /// The server view and its ETag. Untrusted callers see no config.
    pub async fn get_server(&self, trusted: bool) -> Result<(ServerView, String), ClusterError> {
        self.state.server_view(trusted).await
    }

    pub async fn update_server(&self, put: ServerPut, if_match: Option<&str>) -> Result<(), ClusterError> {
        self.state.update_server(put, if_match).await
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Record that this member holds image `fingerprint`.
    pub async fn associate_resource(&self, fingerprint: &str) -> Result<(), ClusterError> {
        self.state.associate_resource(fingerprint).await
    }

    pub async fn disassociate_resource(&self, fingerprint: &str) -> Result<(), ClusterError> {
        self.state.disassociate_resource(fingerprint).await
    }

    pub async fn list_resources(&self) -> Vec<ImageView> {
        self.state.image_views().await
    }

    // ── Operations ──────────────────────────────────────────────────

    pub fn operation(&self, id: &str) -> Result<Operation, ClusterError> {
        self.state.operation(id)
    }

    pub fn operations(&self) -> Vec<OperationView> {
        self.state.operations.list().iter().map(Operation::view).collect()
    }

    // ── Member-to-member ────────────────────────────────────────────

    /// One leader heartbeat round. Returns `None` when this member is
    /// not the leader (or not clustered).
    pub async fn heartbeat_once(&self) -> Result<Option<BroadcastReport>, ClusterError> {
        self.state.heartbeat_once().await
    }

    /// Serve an internal request from another member.
    pub async fn handle_internal(
        &self,
        caller: &PeerIdentity,
        request: InternalRequest,
    ) -> Result<InternalResponse, ClusterError> {
        self.state.handle_internal(caller, request).await
    }
}
