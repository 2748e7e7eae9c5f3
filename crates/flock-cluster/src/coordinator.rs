//! Membership protocols: bootstrap, join, leave, rename, and keeping the
//! node table and cluster-wide config in step across members.
//!
//! Node-table writes are executed by the leader (lowest non-evicted id).
//! Other members forward them and adopt the snapshot that comes back; the
//! leader pushes every committed snapshot to the rest of the cluster.
//! When the leader is unreachable, its forced removal is committed by the
//! next member in id order, which becomes leader.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flock_common::api::member_url;
use flock_common::error::ErrorCode;
use flock_common::etag::{etag_check, etag_hash};
use flock_crypto::identity::certificate_der_from_pem;
use flock_crypto::pinning::fingerprint_sha256;

use crate::config::{self, ConfigChanges};
use crate::error::ClusterError;
use crate::member::{Member, MemberRole, MemberState, MemberStatus};
use crate::mutation::{Mutation, MutationOutcome};
use crate::notify::BroadcastReport;
use crate::operation::{Operation, OperationKind};
use crate::protocol::{
    CertificatesPost, ClusterMemberPost, ClusterPut, ClusterView, ImageView, MemberView, ServerEnvironment,
    ServerPut, ServerView,
};
use crate::store::{ClusterSnapshot, NewMember};
use crate::transport::{AcceptRequest, InternalRequest, InternalResponse, PeerTarget, TransportError};
use crate::trust::{self, PeerIdentity, TrustedCertificate};
use crate::{audit, ClusterEvent, CoreState};

/// Name under which an unclustered daemon lists itself.
pub(crate) const STANDALONE_NAME: &str = "none";

const NOT_CLUSTERED: &str = "this node is not clustered";

fn add_node_error(e: TransportError) -> ClusterError {
    match e {
        TransportError::Api { code, message } => ClusterError::AddNode {
            code,
            reason: message,
        },
        other => ClusterError::AddNode {
            code: ErrorCode::NetworkError,
            reason: other.to_string(),
        },
    }
}

impl CoreState {
    // ── Helpers ─────────────────────────────────────────────────────

    pub(crate) fn emit(&self, event: ClusterEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn audit(&self, event: &str, fields: &[(&str, &str)]) {
        let Some(path) = &self.audit_path else {
            return;
        };
        if let Err(e) = audit::append_entry_to(path, event, fields) {
            tracing::warn!(error = %e, event, "Failed to write audit entry");
        }
    }

    fn own_fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    fn is_self(&self, member: &Member) -> bool {
        member.certificate == self.own_fingerprint()
    }

    /// Every member except this one.
    fn peers(&self, snapshot: &ClusterSnapshot) -> Vec<PeerTarget> {
        snapshot
            .members
            .iter()
            .filter(|m| !self.is_self(m))
            .map(PeerTarget::member)
            .collect()
    }

    pub(crate) async fn is_clustered(&self) -> bool {
        !self.store.snapshot().await.is_empty()
    }

    async fn local_member(&self) -> Option<Member> {
        self.store
            .snapshot()
            .await
            .member_by_certificate(self.own_fingerprint())
            .cloned()
    }

    pub(crate) async fn is_authorized(&self, fingerprint: &str) -> bool {
        if self.trust.lock().await.is_trusted_client(fingerprint) {
            return true;
        }
        self.store
            .snapshot()
            .await
            .member_by_certificate(fingerprint)
            .is_some()
    }

    /// Unix-socket callers, registered clients and members are trusted.
    pub(crate) async fn is_trusted_caller(&self, caller: &PeerIdentity) -> bool {
        match caller {
            PeerIdentity::Local => true,
            PeerIdentity::Remote { fingerprint, .. } => self.is_authorized(fingerprint).await,
            PeerIdentity::Anonymous => false,
        }
    }

    /// The caller's certificate belongs to a current member.
    async fn caller_member(&self, caller: &PeerIdentity) -> Option<Member> {
        let fingerprint = caller.fingerprint()?;
        self.store
            .snapshot()
            .await
            .member_by_certificate(fingerprint)
            .cloned()
    }

    /// Only the leader may push a node table. The caller must be a member
    /// leading the local table, or a successor pushing a table that no
    /// longer holds the old leader.
    async fn is_leader_caller(&self, caller: &PeerIdentity, incoming: &ClusterSnapshot) -> bool {
        let Some(member) = self.caller_member(caller).await else {
            return false;
        };
        let leads = |s: &ClusterSnapshot| s.leader().is_some_and(|l| l.certificate == member.certificate);
        let current = self.store.snapshot().await;
        if leads(&current) {
            return true;
        }
        let old_leader_gone = current.leader().map_or(true, |old| {
            incoming
                .member_by_id(old.id)
                .map_or(true, |m| m.state == MemberState::Evicted)
        });
        old_leader_gone && leads(incoming)
    }

    /// Whether `request` from `caller` may be served.
    async fn may_serve(&self, caller: &PeerIdentity, request: &InternalRequest) -> bool {
        match request {
            InternalRequest::Accept(_) => self.is_trusted_caller(caller).await,
            InternalRequest::Mutate { .. } | InternalRequest::Notify { .. } | InternalRequest::Ping => {
                self.caller_member(caller).await.is_some()
            }
            InternalRequest::Replicate { snapshot } | InternalRequest::Heartbeat { snapshot } => {
                self.is_leader_caller(caller, snapshot).await
            }
        }
    }

    /// Forget transport state of peers that are no longer members.
    fn prune_peers(&self, snapshot: &ClusterSnapshot) {
        let keep: Vec<String> = snapshot
            .members
            .iter()
            .map(|m| m.certificate.clone())
            .collect();
        self.transport.retain_peers(&keep);
    }

    // ── Bootstrap & join ────────────────────────────────────────────

    pub(crate) async fn cluster_view(&self) -> ClusterView {
        match self.local_member().await {
            Some(member) => ClusterView {
                server_name: member.server_name,
                enabled: true,
            },
            None => ClusterView {
                server_name: String::new(),
                enabled: false,
            },
        }
    }

    pub(crate) async fn update_cluster(
        self: &Arc<Self>,
        put: ClusterPut,
        etag: Option<&str>,
    ) -> Result<Operation, ClusterError> {
        if !put.enabled {
            return Err(ClusterError::InvalidPayload(
                "clustering can only be disabled by removing the member".to_string(),
            ));
        }
        etag_check(etag, &self.cluster_view().await)?;
        if put.server_name.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "server name must not be empty".to_string(),
            ));
        }
        let address = self
            .config
            .lock()
            .await
            .https_address()
            .map(str::to_string)
            .ok_or_else(|| {
                ClusterError::PreconditionFailed(format!(
                    "{} must be set before clustering",
                    config::HTTPS_ADDRESS
                ))
            })?;
        if self.is_clustered().await {
            return Err(ClusterError::AlreadyClustered);
        }

        if put.cluster_address.is_empty() {
            return Ok(self.spawn_bootstrap(put.server_name, address));
        }

        if put.cluster_certificate.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "cluster_certificate is required to join".to_string(),
            ));
        }
        let der = certificate_der_from_pem(&put.cluster_certificate)?;
        let target = PeerTarget {
            address: put.cluster_address,
            fingerprint: fingerprint_sha256(&der),
        };
        Ok(self.spawn_join(put.server_name, address, target))
    }

    fn spawn_bootstrap(self: &Arc<Self>, server_name: String, address: String) -> Operation {
        let state = Arc::clone(self);
        self.operations
            .spawn(OperationKind::Bootstrap, true, move |op| async move {
                let _guard = state.membership_change.lock().await;
                op.enter_uncancellable()?;

                let certificate = state.own_fingerprint().to_string();
                let (member, _) = state
                    .store
                    .transaction(move |tx| {
                        if !tx.is_empty() {
                            return Err(ClusterError::AlreadyClustered);
                        }
                        tx.add_member(NewMember {
                            server_name,
                            address,
                            certificate,
                        })
                    })
                    .await?;

                tracing::info!(
                    member = %member.server_name,
                    address = %member.address,
                    "Cluster bootstrapped"
                );
                state.audit(
                    "cluster_bootstrapped",
                    &[
                        ("name", member.server_name.as_str()),
                        ("address", member.address.as_str()),
                    ],
                );
                state.emit(ClusterEvent::Bootstrapped {
                    server_name: member.server_name,
                });
                Ok(())
            })
    }

    /// Ask `target` to add us. No local transaction is held during the
    /// round trip; the returned snapshot is adopted afterwards.
    fn spawn_join(self: &Arc<Self>, server_name: String, address: String, target: PeerTarget) -> Operation {
        let state = Arc::clone(self);
        self.operations
            .spawn(OperationKind::Join, true, move |op| async move {
                let _guard = state.membership_change.lock().await;
                if state.is_clustered().await {
                    return Err(ClusterError::AlreadyClustered);
                }
                op.enter_uncancellable()?;

                tracing::info!(member = %server_name, target = %target.address, "Joining cluster");
                let request = InternalRequest::Accept(AcceptRequest {
                    server_name: server_name.clone(),
                    address,
                });
                let (snapshot, shared) = state
                    .transport
                    .send(&target, request)
                    .await
                    .map_err(add_node_error)?
                    .into_joined()?;

                let member = snapshot
                    .member_by_certificate(state.own_fingerprint())
                    .cloned()
                    .ok_or_else(|| {
                        ClusterError::Internal("join target did not add this node".to_string())
                    })?;
                state.store.adopt(snapshot).await?;
                state.adopt_cluster_config(&shared).await?;

                let id = member.id.to_string();
                tracing::info!(member = %member.server_name, id = member.id, role = ?member.role, "Joined cluster");
                state.audit(
                    "cluster_joined",
                    &[
                        ("name", member.server_name.as_str()),
                        ("id", id.as_str()),
                        ("target", target.address.as_str()),
                    ],
                );
                state.emit(ClusterEvent::Joined {
                    server_name: member.server_name,
                });
                Ok(())
            })
    }

    // ── Members ─────────────────────────────────────────────────────

    fn member_view(&self, member: &Member, now: DateTime<Utc>) -> MemberView {
        let status = member.status(now, self.settings.offline_threshold());
        let message = match status {
            MemberStatus::Online => "fully operational".to_string(),
            MemberStatus::Offline => format!("no heartbeat since {}", member.heartbeat.to_rfc3339()),
        };
        MemberView {
            server_name: member.server_name.clone(),
            url: member_url(&member.server_name),
            database: member.is_database(),
            status,
            message,
            id: member.id,
            address: member.address.clone(),
            role: member.role,
            state: member.state,
        }
    }

    async fn standalone_view(&self) -> MemberView {
        let address = self
            .config
            .lock()
            .await
            .https_address()
            .unwrap_or_default()
            .to_string();
        MemberView {
            server_name: STANDALONE_NAME.to_string(),
            url: member_url(STANDALONE_NAME),
            database: false,
            status: MemberStatus::Online,
            message: "fully operational".to_string(),
            id: 0,
            address,
            role: MemberRole::Spare,
            state: MemberState::Online,
        }
    }

    /// Members ordered by id; an unclustered daemon lists only itself.
    pub(crate) async fn member_views(&self) -> Vec<MemberView> {
        let mut snapshot = self.store.snapshot().await;
        if snapshot.is_empty() {
            return vec![self.standalone_view().await];
        }
        snapshot.members.sort_by_key(|m| m.id);
        let now = Utc::now();
        snapshot
            .members
            .iter()
            .map(|m| self.member_view(m, now))
            .collect()
    }

    pub(crate) async fn member_view_by_name(&self, name: &str) -> Result<MemberView, ClusterError> {
        let snapshot = self.store.snapshot().await;
        if snapshot.is_empty() && name == STANDALONE_NAME {
            return Ok(self.standalone_view().await);
        }
        snapshot
            .member_by_name(name)
            .map(|m| self.member_view(m, Utc::now()))
            .ok_or_else(|| ClusterError::NotFound(format!("member not found: {name}")))
    }

    pub(crate) async fn rename_member(
        self: &Arc<Self>,
        name: &str,
        post: ClusterMemberPost,
    ) -> Result<(), ClusterError> {
        let new_name = post.server_name;
        if new_name.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "server name must not be empty".to_string(),
            ));
        }
        let snapshot = self.store.snapshot().await;
        if snapshot.member_by_name(name).is_none() {
            return Err(ClusterError::NotFound(format!("member not found: {name}")));
        }
        if snapshot.member_by_name(&new_name).is_some() {
            return Err(ClusterError::Conflict(format!(
                "member name already in use: {new_name}"
            )));
        }

        let mutation = Mutation::Rename {
            from: name.to_string(),
            to: new_name,
        };
        self.run_mutation(OperationKind::Rename, mutation).await
    }

    /// Remove `name` from the cluster. Without `force`, a member that is
    /// the only holder of an image may not leave.
    pub(crate) async fn delete_member(self: &Arc<Self>, name: &str, force: bool) -> Result<(), ClusterError> {
        let snapshot = self.store.snapshot().await;
        if snapshot.is_empty() {
            return Err(ClusterError::PreconditionFailed(NOT_CLUSTERED.to_string()));
        }
        let member = snapshot
            .member_by_name(name)
            .ok_or_else(|| ClusterError::NotFound(format!("member not found: {name}")))?;
        if !force && member.state != MemberState::Evicted {
            let sole = snapshot.resources.sole_owned_by(member.id);
            if !sole.is_empty() {
                return Err(ClusterError::ResourceConflict(sole.into_iter().collect()));
            }
        }

        let mutation = Mutation::Remove {
            name: name.to_string(),
            force,
        };
        self.run_mutation(OperationKind::Leave, mutation).await
    }

    /// Run a synchronous node-table change as a recorded, non-cancellable
    /// operation and wait for it.
    async fn run_mutation(self: &Arc<Self>, kind: OperationKind, mutation: Mutation) -> Result<(), ClusterError> {
        let state = Arc::clone(self);
        let op = self.operations.spawn(kind, false, move |_op| async move {
            state.submit(mutation).await.map(|_| ())
        });
        op.wait().await
    }

    // ── Replication ─────────────────────────────────────────────────

    /// Apply `mutation` on the leader: locally when we are the leader,
    /// otherwise forwarded. Returns the resulting snapshot.
    pub(crate) async fn submit(self: &Arc<Self>, mutation: Mutation) -> Result<ClusterSnapshot, ClusterError> {
        let snapshot = self.store.snapshot().await;
        let leader = snapshot
            .leader()
            .cloned()
            .ok_or_else(|| ClusterError::PreconditionFailed(NOT_CLUSTERED.to_string()))?;

        if self.is_self(&leader) {
            let (_, snapshot) = self.commit(&mutation).await?;
            return Ok(snapshot);
        }

        tracing::debug!(leader = %leader.server_name, "Forwarding mutation to leader");
        let forwarded = self
            .transport
            .send(
                &PeerTarget::member(&leader),
                InternalRequest::Mutate {
                    mutation: mutation.clone(),
                },
            )
            .await;
        let snapshot = match forwarded {
            Ok(response) => response.into_snapshot()?,
            Err(e) if !matches!(e, TransportError::Api { .. }) && mutation.evicts(&leader.server_name) => {
                tracing::warn!(leader = %leader.server_name, error = %e, "Leader unreachable, handing its removal to the successor");
                return self.fail_over(&snapshot, &leader, mutation).await;
            }
            Err(e) => return Err(e.into()),
        };
        self.receive_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Remove the unreachable `leader` through the next member in id order.
    async fn fail_over(
        &self,
        snapshot: &ClusterSnapshot,
        leader: &Member,
        mutation: Mutation,
    ) -> Result<ClusterSnapshot, ClusterError> {
        let successor = snapshot.successor(leader.id).cloned().ok_or_else(|| {
            ClusterError::Network(format!("leader {} is unreachable", leader.server_name))
        })?;

        if self.is_self(&successor) {
            let (_, committed) = self.take_over(leader, &mutation).await?;
            return Ok(committed);
        }

        let committed = self
            .transport
            .send(&PeerTarget::member(&successor), InternalRequest::Mutate { mutation })
            .await?
            .into_snapshot()?;
        self.receive_snapshot(committed.clone()).await?;
        Ok(committed)
    }

    async fn take_over(
        &self,
        leader: &Member,
        mutation: &Mutation,
    ) -> Result<(MutationOutcome, ClusterSnapshot), ClusterError> {
        tracing::warn!(leader = %leader.server_name, "Taking over as cluster leader");
        self.audit("leader_taken_over", &[("from", leader.server_name.as_str())]);
        self.commit(mutation).await
    }

    /// True when `member` answers a ping. An API error still proves it is up.
    async fn is_reachable(&self, member: &Member) -> bool {
        let target = PeerTarget::member(member);
        let ping = self.transport.send(&target, InternalRequest::Ping);
        match tokio::time::timeout(self.settings.notify_timeout(), ping).await {
            Ok(Ok(_)) | Ok(Err(TransportError::Api { .. })) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Leader side: run the transaction, then push the new snapshot to
    /// every other member, including one that was just removed.
    async fn commit(&self, mutation: &Mutation) -> Result<(MutationOutcome, ClusterSnapshot), ClusterError> {
        let (outcome, snapshot) = self.store.transaction(|tx| mutation.apply(tx)).await?;

        let mut targets: Vec<PeerTarget> = snapshot
            .members
            .iter()
            .filter(|m| !self.is_self(m))
            // The joiner adopts the snapshot from the accept response.
            .filter(|m| !matches!(&outcome, MutationOutcome::Accepted(new) if new.id == m.id))
            .map(PeerTarget::member)
            .collect();
        if let MutationOutcome::Removed { member, .. } = &outcome {
            if !self.is_self(member) {
                targets.push(PeerTarget::member(member));
            }
        }

        let report = self
            .notifier
            .broadcast(
                targets,
                InternalRequest::Replicate {
                    snapshot: snapshot.clone(),
                },
            )
            .await;
        if !report.all_delivered() {
            tracing::warn!(
                version = snapshot.version,
                failed = report.failed.len(),
                "Node table did not reach every member"
            );
        }

        self.record(&outcome);
        if snapshot.member_by_certificate(self.own_fingerprint()).is_none() {
            self.leave_cluster_mode().await?;
        } else {
            self.prune_peers(&snapshot);
        }
        Ok((outcome, snapshot))
    }

    fn record(&self, outcome: &MutationOutcome) {
        match outcome {
            MutationOutcome::Accepted(member) => {
                let id = member.id.to_string();
                tracing::info!(
                    member = %member.server_name,
                    id = member.id,
                    address = %member.address,
                    role = ?member.role,
                    "Member joined"
                );
                self.audit(
                    "member_joined",
                    &[
                        ("name", member.server_name.as_str()),
                        ("id", id.as_str()),
                        ("address", member.address.as_str()),
                    ],
                );
                self.emit(ClusterEvent::MemberJoined {
                    server_name: member.server_name.clone(),
                    id: member.id,
                });
            }
            MutationOutcome::Renamed { from, member } => {
                tracing::info!(from = %from, to = %member.server_name, "Member renamed");
                self.audit(
                    "member_renamed",
                    &[("from", from.as_str()), ("to", member.server_name.as_str())],
                );
                self.emit(ClusterEvent::MemberRenamed {
                    from: from.clone(),
                    to: member.server_name.clone(),
                });
            }
            MutationOutcome::Removed { member, deleted } => {
                let deleted_list = deleted.join(",");
                tracing::info!(
                    member = %member.server_name,
                    id = member.id,
                    deleted_images = %deleted_list,
                    "Member removed"
                );
                self.audit(
                    "member_removed",
                    &[
                        ("name", member.server_name.as_str()),
                        ("deleted_images", deleted_list.as_str()),
                    ],
                );
                self.emit(ClusterEvent::MemberRemoved {
                    server_name: member.server_name.clone(),
                    deleted: deleted.clone(),
                });
            }
            MutationOutcome::Resource => {}
        }
    }

    /// Adopt a snapshot pushed by the leader. Unclustered daemons ignore
    /// pushes; only a join installs a first snapshot.
    async fn receive_snapshot(&self, snapshot: ClusterSnapshot) -> Result<(), ClusterError> {
        let current = self.store.snapshot().await;
        if current.is_empty() || snapshot.version <= current.version {
            tracing::debug!(
                incoming = snapshot.version,
                local = current.version,
                "Ignoring snapshot"
            );
            return Ok(());
        }
        if snapshot.member_by_certificate(self.own_fingerprint()).is_none() {
            return self.leave_cluster_mode().await;
        }
        if self.store.replace_if_newer(snapshot.clone()).await? {
            self.prune_peers(&snapshot);
        }
        Ok(())
    }

    async fn leave_cluster_mode(&self) -> Result<(), ClusterError> {
        self.store.clear().await?;
        self.transport.retain_peers(&[]);
        tracing::info!("Left the cluster");
        self.audit("cluster_left", &[]);
        self.emit(ClusterEvent::LeftCluster);
        Ok(())
    }

    // ── Internal API ────────────────────────────────────────────────

    pub(crate) async fn handle_internal(
        self: &Arc<Self>,
        caller: &PeerIdentity,
        request: InternalRequest,
    ) -> Result<InternalResponse, ClusterError> {
        if !self.may_serve(caller, &request).await {
            tracing::warn!(
                fingerprint = caller.fingerprint().unwrap_or("-"),
                request = request.name(),
                "Rejected internal request"
            );
            return Err(ClusterError::Unauthorized);
        }

        match request {
            InternalRequest::Accept(accept) => {
                let certificate = caller
                    .fingerprint()
                    .ok_or_else(|| {
                        ClusterError::InvalidPayload(
                            "joining node must present a certificate".to_string(),
                        )
                    })?
                    .to_string();
                if !self.is_clustered().await {
                    return Err(ClusterError::PreconditionFailed(NOT_CLUSTERED.to_string()));
                }
                let snapshot = self
                    .submit(Mutation::Accept {
                        server_name: accept.server_name,
                        address: accept.address,
                        certificate,
                    })
                    .await?;
                let config = self.config.lock().await.shared();
                Ok(InternalResponse::Joined { snapshot, config })
            }
            InternalRequest::Mutate { mutation } => {
                let current = self.store.snapshot().await;
                let leader = current
                    .leader()
                    .cloned()
                    .ok_or_else(|| ClusterError::PreconditionFailed(NOT_CLUSTERED.to_string()))?;
                let (_, snapshot) = if self.is_self(&leader) {
                    self.commit(&mutation).await?
                } else if self.may_take_over(&current, &leader, &mutation).await {
                    self.take_over(&leader, &mutation).await?
                } else {
                    return Err(ClusterError::PreconditionFailed(
                        "not the cluster leader".to_string(),
                    ));
                };
                Ok(InternalResponse::Snapshot { snapshot })
            }
            InternalRequest::Replicate { snapshot } | InternalRequest::Heartbeat { snapshot } => {
                self.receive_snapshot(snapshot).await?;
                Ok(InternalResponse::Ack)
            }
            InternalRequest::Notify { changes } => {
                self.apply_notified_config(&changes).await?;
                Ok(InternalResponse::Ack)
            }
            InternalRequest::Ping => Ok(InternalResponse::Ack),
        }
    }

    /// A forwarded eviction of the leader is ours to commit when we are
    /// next in line and the leader does not answer us either.
    async fn may_take_over(&self, snapshot: &ClusterSnapshot, leader: &Member, mutation: &Mutation) -> bool {
        mutation.evicts(&leader.server_name)
            && snapshot.successor(leader.id).is_some_and(|s| self.is_self(s))
            && !self.is_reachable(leader).await
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    /// Heartbeat every other member with the current snapshot, record who
    /// answered, mark members silent past the threshold offline, then push
    /// the refreshed table to the members that answered.
    pub(crate) async fn heartbeat_once(&self) -> Result<Option<BroadcastReport>, ClusterError> {
        let snapshot = self.store.snapshot().await;
        let Some(own) = snapshot
            .leader()
            .filter(|l| self.is_self(l))
            .map(|l| l.id)
        else {
            return Ok(None);
        };

        let peers: Vec<Member> = snapshot
            .members
            .iter()
            .filter(|m| !self.is_self(m))
            .cloned()
            .collect();
        let report = self
            .notifier
            .broadcast(
                peers.iter().map(PeerTarget::member).collect(),
                InternalRequest::Heartbeat {
                    snapshot: snapshot.clone(),
                },
            )
            .await;

        let responders: Vec<i64> = peers
            .iter()
            .filter(|m| report.delivered.contains(&m.address))
            .map(|m| m.id)
            .collect();
        let threshold = self.settings.offline_threshold();
        let (went_offline, committed) = self
            .store
            .transaction(move |tx| {
                tx.touch(own);
                for id in &responders {
                    tx.touch(*id);
                }
                let now = tx.now();
                let stale: Vec<Member> = tx
                    .snapshot()
                    .members
                    .iter()
                    .filter(|m| m.state == MemberState::Online)
                    .filter(|m| m.status(now, threshold) == MemberStatus::Offline)
                    .cloned()
                    .collect();
                for member in &stale {
                    tx.set_state(member.id, MemberState::Offline);
                }
                Ok(stale)
            })
            .await?;

        for member in went_offline {
            tracing::warn!(
                member = %member.server_name,
                last_heartbeat = %member.heartbeat.to_rfc3339(),
                "Member went offline"
            );
            self.audit("member_offline", &[("name", member.server_name.as_str())]);
        }

        let responding: Vec<PeerTarget> = peers
            .iter()
            .filter(|m| report.delivered.contains(&m.address))
            .map(PeerTarget::member)
            .collect();
        if !responding.is_empty() {
            self.notifier
                .broadcast(responding, InternalRequest::Replicate { snapshot: committed })
                .await;
        }
        Ok(Some(report))
    }

    // ── Trust ───────────────────────────────────────────────────────

    pub(crate) async fn register_certificate(
        &self,
        post: CertificatesPost,
        caller: &PeerIdentity,
    ) -> Result<TrustedCertificate, ClusterError> {
        let caller_trusted = match caller.fingerprint() {
            Some(fingerprint) => self.is_authorized(fingerprint).await,
            None => false,
        };
        let password_hash = self
            .config
            .lock()
            .await
            .trust_password_hash()
            .map(str::to_string);

        let entry = trust::admit(&post, caller, caller_trusted, password_hash.as_deref())?;
        self.trust.lock().await.add(entry.clone())?;

        tracing::info!(name = %entry.name, fingerprint = %entry.fingerprint, "Certificate trusted");
        self.audit(
            "certificate_added",
            &[
                ("name", entry.name.as_str()),
                ("fingerprint", entry.fingerprint.as_str()),
            ],
        );
        Ok(entry)
    }

    pub(crate) async fn remove_certificate(&self, fingerprint: &str) -> Result<(), ClusterError> {
        let removed = self.trust.lock().await.remove(fingerprint)?;
        tracing::info!(name = %removed.name, fingerprint, "Certificate removed");
        self.audit(
            "certificate_removed",
            &[("name", removed.name.as_str()), ("fingerprint", fingerprint)],
        );
        Ok(())
    }

    // ── Server config ───────────────────────────────────────────────

    pub(crate) async fn server_view(&self, trusted: bool) -> Result<(ServerView, String), ClusterError> {
        let (rendered, address) = {
            let config = self.config.lock().await;
            (config.rendered(), config.https_address().map(str::to_string))
        };
        let etag = etag_hash(&rendered)?;
        let cluster = self.cluster_view().await;

        let view = ServerView {
            config: if trusted { rendered } else { BTreeMap::new() },
            auth: if trusted { "trusted" } else { "untrusted" }.to_string(),
            environment: ServerEnvironment {
                server_name: if cluster.enabled {
                    cluster.server_name
                } else {
                    STANDALONE_NAME.to_string()
                },
                server_clustered: cluster.enabled,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                addresses: address.into_iter().collect(),
                certificate: self.identity.cert_pem().to_string(),
                certificate_fingerprint: self.own_fingerprint().to_string(),
            },
        };
        Ok((view, etag))
    }

    /// Replace the server config, then tell the other members about the
    /// cluster-wide keys that changed. Undelivered notifications are logged.
    pub(crate) async fn update_server(&self, put: ServerPut, if_match: Option<&str>) -> Result<(), ClusterError> {
        let changes = {
            let mut config = self.config.lock().await;
            etag_check(if_match, &config.rendered())?;
            let clustered = self.is_clustered().await;
            config.replace(&put.config, clustered)?
        };
        if changes.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = changes.keys().cloned().collect();
        tracing::info!(keys = ?keys, "Server configuration updated");
        self.emit(ClusterEvent::ConfigChanged { keys });

        let shared = config::cluster_wide(&changes);
        let snapshot = self.store.snapshot().await;
        if shared.is_empty() || snapshot.is_empty() {
            return Ok(());
        }
        let report = self
            .notifier
            .broadcast(self.peers(&snapshot), InternalRequest::Notify { changes: shared })
            .await;
        if !report.all_delivered() {
            tracing::warn!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Configuration change did not reach every member"
            );
        }
        Ok(())
    }

    /// Install the cluster-wide config received when joining.
    async fn adopt_cluster_config(&self, shared: &BTreeMap<String, String>) -> Result<(), ClusterError> {
        let applied = self.config.lock().await.adopt_shared(shared)?;
        if !applied.is_empty() {
            tracing::info!(keys = ?applied, "Adopted cluster configuration");
            self.emit(ClusterEvent::ConfigChanged { keys: applied });
        }
        Ok(())
    }

    async fn apply_notified_config(&self, changes: &ConfigChanges) -> Result<(), ClusterError> {
        let applied = self.config.lock().await.apply_changes(changes)?;
        if !applied.is_empty() {
            tracing::info!(keys = ?applied, "Applied configuration from peer");
            self.emit(ClusterEvent::ConfigChanged { keys: applied });
        }
        Ok(())
    }

    // ── Images ──────────────────────────────────────────────────────

    pub(crate) async fn associate_resource(self: &Arc<Self>, fingerprint: &str) -> Result<(), ClusterError> {
        let member_id = self.resource_owner(fingerprint).await?;
        self.submit(Mutation::Associate {
            resource: fingerprint.to_string(),
            member_id,
        })
        .await?;
        tracing::debug!(image = fingerprint, "Image associated with this member");
        Ok(())
    }

    pub(crate) async fn disassociate_resource(self: &Arc<Self>, fingerprint: &str) -> Result<(), ClusterError> {
        let member_id = self.resource_owner(fingerprint).await?;
        self.submit(Mutation::Disassociate {
            resource: fingerprint.to_string(),
            member_id,
        })
        .await?;
        tracing::debug!(image = fingerprint, "Image disassociated from this member");
        Ok(())
    }

    async fn resource_owner(&self, fingerprint: &str) -> Result<i64, ClusterError> {
        if fingerprint.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "image fingerprint must not be empty".to_string(),
            ));
        }
        self.local_member()
            .await
            .map(|m| m.id)
            .ok_or_else(|| ClusterError::PreconditionFailed(NOT_CLUSTERED.to_string()))
    }

    pub(crate) async fn image_views(&self) -> Vec<ImageView> {
        let snapshot = self.store.snapshot().await;
        snapshot
            .resources
            .list()
            .into_iter()
            .map(|(fingerprint, holders)| ImageView {
                fingerprint,
                members: holders
                    .iter()
                    .filter_map(|id| snapshot.member_by_id(*id))
                    .map(|m| m.server_name.clone())
                    .collect(),
            })
            .collect()
    }

    // ── Operations ──────────────────────────────────────────────────

    pub(crate) fn operation(&self, id: &str) -> Result<Operation, ClusterError> {
        self.operations
            .get(id)
            .ok_or_else(|| ClusterError::NotFound(format!("operation not found: {id}")))
    }
}
