//! Member-to-member requests and the transport seam they travel over.
//!
//! Production uses [`HttpsTransport`](crate::https::HttpsTransport) (mutual
//! TLS, server pinned by fingerprint). Tests wire members together with
//! [`InProcessNetwork`](crate::local::InProcessNetwork).

use std::collections::BTreeMap;

use async_trait::async_trait;
use flock_common::error::ErrorCode;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::member::Member;
use crate::mutation::Mutation;
use crate::store::ClusterSnapshot;

/// Where to send a request, and which certificate must answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub address: String,
    pub fingerprint: String,
}

impl PeerTarget {
    pub fn member(member: &Member) -> Self {
        Self {
            address: member.address.clone(),
            fingerprint: member.certificate.clone(),
        }
    }
}

/// Body of `POST /internal/cluster/accept`: a node asks to be added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub server_name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalRequest {
    /// Join: sent by the joining node to its chosen target.
    Accept(AcceptRequest),
    /// A node-table write forwarded to the leader.
    Mutate { mutation: Mutation },
    /// The leader pushing a committed snapshot.
    Replicate { snapshot: ClusterSnapshot },
    /// Leader liveness check, carrying its current snapshot.
    Heartbeat { snapshot: ClusterSnapshot },
    /// Cluster-wide server config keys changed on the sender.
    Notify {
        changes: BTreeMap<String, Option<String>>,
    },
    /// Liveness check before a member takes over from the leader.
    Ping,
}

impl InternalRequest {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Accept(_) => "/internal/cluster/accept",
            Self::Mutate { .. } => "/internal/cluster/mutate",
            Self::Replicate { .. } => "/internal/cluster/replicate",
            Self::Heartbeat { .. } => "/internal/cluster/heartbeat",
            Self::Notify { .. } => "/internal/config/notify",
            Self::Ping => "/internal/cluster/ping",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accept(_) => "accept",
            Self::Mutate { .. } => "mutate",
            Self::Replicate { .. } => "replicate",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Notify { .. } => "notify",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalResponse {
    Snapshot { snapshot: ClusterSnapshot },
    /// Answer to `Accept`: the node table and the cluster-wide config.
    Joined {
        snapshot: ClusterSnapshot,
        config: BTreeMap<String, String>,
    },
    Ack,
}

impl InternalResponse {
    pub fn into_snapshot(self) -> Result<ClusterSnapshot, ClusterError> {
        match self {
            Self::Snapshot { snapshot } | Self::Joined { snapshot, .. } => Ok(snapshot),
            Self::Ack => Err(ClusterError::Internal(
                "peer answered without a snapshot".to_string(),
            )),
        }
    }

    pub fn into_joined(self) -> Result<(ClusterSnapshot, BTreeMap<String, String>), ClusterError> {
        match self {
            Self::Joined { snapshot, config } => Ok((snapshot, config)),
            _ => Err(ClusterError::Internal(
                "join target answered without the cluster config".to_string(),
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer answered with an API error.
    #[error("{message}")]
    Api { code: ErrorCode, message: String },

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<TransportError> for ClusterError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Api { code, message } => Self::Remote { code, message },
            other => Self::Network(other.to_string()),
        }
    }
}

/// Sends internal requests to other members as this daemon.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(
        &self,
        target: &PeerTarget,
        request: InternalRequest,
    ) -> Result<InternalResponse, TransportError>;

    /// Drop cached per-peer state for certificates outside `keep`.
    fn retain_peers(&self, _keep: &[String]) {}
}
