//! In-process peer network for multi-node tests and embedding.
//!
//! Cores attach under their `host:port` address. A request is delivered
//! by calling the target core's internal handler directly, with the
//! sender's certificate as caller identity, so authorization and
//! pinning behave as they do over HTTPS. Addresses can be partitioned
//! to simulate unreachable members.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use flock_crypto::identity::ServerIdentity;
use flock_crypto::pinning::fingerprints_match;

use crate::transport::{InternalRequest, InternalResponse, PeerTarget, PeerTransport, TransportError};
use crate::trust::PeerIdentity;
use crate::{ClusterCore, WeakClusterCore};

struct Node {
    core: WeakClusterCore,
    fingerprint: String,
}

#[derive(Default)]
struct NetworkInner {
    nodes: RwLock<HashMap<String, Node>>,
    partitioned: RwLock<HashSet<String>>,
}

/// Registry of cores reachable from each other. Holds weak references,
/// so dropping a core makes its address unreachable.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    inner: Arc<NetworkInner>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sends as `identity`.
    pub fn transport(&self, identity: &ServerIdentity) -> Arc<dyn PeerTransport> {
        Arc::new(InProcessTransport {
            network: self.clone(),
            caller: PeerIdentity::from_certificate(identity.cert_der()),
        })
    }

    pub fn attach(&self, address: &str, core: &ClusterCore) {
        let node = Node {
            core: core.downgrade(),
            fingerprint: core.fingerprint().to_string(),
        };
        self.write_nodes().insert(address.to_string(), node);
    }

    pub fn detach(&self, address: &str) {
        self.write_nodes().remove(address);
    }

    /// Make `address` unreachable in both directions.
    pub fn partition(&self, address: &str) {
        self.inner
            .partitioned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.inner
            .partitioned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, target: &PeerTarget, caller: &PeerIdentity) -> Result<ClusterCore, TransportError> {
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let partitioned = self
            .inner
            .partitioned
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let caller_cut_off = nodes.iter().any(|(address, node)| {
            caller.fingerprint() == Some(node.fingerprint.as_str()) && partitioned.contains(address)
        });
        if caller_cut_off || partitioned.contains(&target.address) {
            return Err(TransportError::Unreachable(format!(
                "{}: network partitioned",
                target.address
            )));
        }

        let node = nodes
            .get(&target.address)
            .ok_or_else(|| TransportError::Unreachable(format!("{}: no route to host", target.address)))?;
        if !fingerprints_match(&node.fingerprint, &target.fingerprint) {
            return Err(TransportError::Unreachable(format!(
                "{}: server certificate does not match pinned fingerprint",
                target.address
            )));
        }
        node.core
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable(format!("{}: connection refused", target.address)))
    }
}

struct InProcessTransport {
    network: InProcessNetwork,
    caller: PeerIdentity,
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn send(
        &self,
        target: &PeerTarget,
        request: InternalRequest,
    ) -> Result<InternalResponse, TransportError> {
        let core = self.network.resolve(target, &self.caller)?;
        core.handle_internal(&self.caller, request)
            .await
            .map_err(|e| TransportError::Api {
                code: e.code(),
                message: e.to_string(),
            })
    }
}
