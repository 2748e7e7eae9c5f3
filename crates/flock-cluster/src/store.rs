//! Replicated node table with transactional access.
//!
//! Every member keeps a local replica ([`ClusterSnapshot`]). Writes go
//! through [`MembershipStore::transaction`]: the closure mutates a private
//! working copy, and the copy replaces the committed snapshot (and is
//! persisted) only if the closure returns `Ok`. An `Err` discards it.
//! Closures are synchronous, so no network round trip can happen while
//! the table is held.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ClusterError;
use crate::member::{self, Member, MemberRole, MemberState};
use crate::resources::ResourceTable;

/// The complete node table, serialized to `<data>/state/cluster.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    /// Bumped by every committed transaction; replicas only move forward.
    pub version: u64,
    /// Next member id to hand out. Ids are never reused.
    #[serde(default)]
    pub next_id: i64,
    pub members: Vec<Member>,
    #[serde(default)]
    pub resources: ResourceTable,
}

impl ClusterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_by_name(&self, server_name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.server_name == server_name)
    }

    pub fn member_by_id(&self, id: i64) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_by_certificate(&self, fingerprint: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.certificate == fingerprint)
    }

    /// The member that executes writes: lowest id that is not evicted.
    pub fn leader(&self) -> Option<&Member> {
        self.members
            .iter()
            .filter(|m| m.state != MemberState::Evicted)
            .min_by_key(|m| m.id)
    }

    /// The member that takes over when the leader `leader_id` is gone.
    pub fn successor(&self, leader_id: i64) -> Option<&Member> {
        self.members
            .iter()
            .filter(|m| m.id != leader_id && m.state != MemberState::Evicted)
            .min_by_key(|m| m.id)
    }

    /// Resource fingerprints held by `member`, sorted.
    pub fn resources_of(&self, member: i64) -> Vec<String> {
        self.resources
            .iter()
            .filter(|(_, holders)| holders.contains(&member))
            .map(|(resource, _)| resource.clone())
            .collect()
    }
}

/// Fields of a member about to be appended.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub server_name: String,
    pub address: String,
    pub certificate: String,
}

/// Mutable view of the working copy inside a transaction.
pub struct NodeTx<'a> {
    snapshot: &'a mut ClusterSnapshot,
    now: DateTime<Utc>,
}

impl NodeTx<'_> {
    pub fn snapshot(&self) -> &ClusterSnapshot {
        self.snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Append a member with a freshly allocated id.
    ///
    /// Name, address and certificate must all be unused.
    pub fn add_member(&mut self, new: NewMember) -> Result<Member, ClusterError> {
        if new.server_name.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "server name must not be empty".to_string(),
            ));
        }
        if self.snapshot.member_by_name(&new.server_name).is_some() {
            return Err(ClusterError::Conflict(format!(
                "member name already in use: {}",
                new.server_name
            )));
        }
        if self.snapshot.members.iter().any(|m| m.address == new.address) {
            return Err(ClusterError::Conflict(format!(
                "member address already in use: {}",
                new.address
            )));
        }
        if self.snapshot.member_by_certificate(&new.certificate).is_some() {
            return Err(ClusterError::Conflict(
                "certificate already belongs to a member".to_string(),
            ));
        }

        let floor = self.snapshot.members.iter().map(|m| m.id + 1).max().unwrap_or(1);
        let id = self.snapshot.next_id.max(floor);
        self.snapshot.next_id = id + 1;

        let member = Member {
            id,
            server_name: new.server_name,
            address: new.address,
            role: member::next_role(&self.snapshot.members),
            state: MemberState::Online,
            certificate: new.certificate,
            heartbeat: self.now,
        };
        self.snapshot.members.push(member.clone());
        Ok(member)
    }

    /// Change a member's name. Id and role are untouched.
    pub fn rename_member(&mut self, from: &str, to: &str) -> Result<Member, ClusterError> {
        if to.is_empty() {
            return Err(ClusterError::InvalidPayload(
                "server name must not be empty".to_string(),
            ));
        }
        if self.snapshot.member_by_name(to).is_some() {
            return Err(ClusterError::Conflict(format!(
                "member name already in use: {to}"
            )));
        }
        let member = self
            .snapshot
            .members
            .iter_mut()
            .find(|m| m.server_name == from)
            .ok_or_else(|| ClusterError::NotFound(format!("member not found: {from}")))?;
        member.server_name = to.to_string();
        Ok(member.clone())
    }

    /// Remove a member row and refill consensus roles.
    pub fn remove_member(&mut self, server_name: &str) -> Result<Member, ClusterError> {
        let index = self
            .snapshot
            .members
            .iter()
            .position(|m| m.server_name == server_name)
            .ok_or_else(|| ClusterError::NotFound(format!("member not found: {server_name}")))?;
        let removed = self.snapshot.members.remove(index);
        if removed.role != MemberRole::Spare {
            member::rebalance_roles(&mut self.snapshot.members);
        }
        Ok(removed)
    }

    pub fn resources(&mut self) -> &mut ResourceTable {
        &mut self.snapshot.resources
    }

    /// Record a successful heartbeat for `id`.
    pub fn touch(&mut self, id: i64) {
        let now = self.now;
        if let Some(m) = self.snapshot.members.iter_mut().find(|m| m.id == id) {
            m.heartbeat = now;
            if m.state != MemberState::Evicted {
                m.state = MemberState::Online;
            }
        }
    }

    pub fn set_state(&mut self, id: i64, state: MemberState) {
        if let Some(m) = self.snapshot.members.iter_mut().find(|m| m.id == id) {
            m.state = state;
        }
    }
}

/// The local replica of the node table.
pub struct MembershipStore {
    path: Option<PathBuf>,
    current: Mutex<ClusterSnapshot>,
}

impl MembershipStore {
    /// Open the replica at `path`, or an in-memory one when `None`.
    pub fn open(path: Option<PathBuf>) -> Result<Self, ClusterError> {
        let snapshot = match &path {
            Some(p) => {
                flock_common::persist::read_json_if_exists::<ClusterSnapshot>(p)?.unwrap_or_default()
            }
            None => ClusterSnapshot::default(),
        };
        Ok(Self {
            path,
            current: Mutex::new(snapshot),
        })
    }

    /// A copy of the committed snapshot.
    pub async fn snapshot(&self) -> ClusterSnapshot {
        self.current.lock().await.clone()
    }

    /// Run `f` against a working copy; commit on `Ok`, discard on `Err`.
    ///
    /// Concurrent transactions are serialized. Returns the closure's value
    /// together with the newly committed snapshot.
    pub async fn transaction<T, F>(&self, f: F) -> Result<(T, ClusterSnapshot), ClusterError>
    where
        F: FnOnce(&mut NodeTx<'_>) -> Result<T, ClusterError>,
    {
        let mut current = self.current.lock().await;
        let mut working = current.clone();

        let value = {
            let mut tx = NodeTx {
                snapshot: &mut working,
                now: Utc::now(),
            };
            f(&mut tx)?
        };

        working.version = current.version + 1;
        self.persist(&working)?;
        *current = working.clone();
        Ok((value, working))
    }

    /// Adopt a replicated snapshot if it is newer than the local one.
    pub async fn replace_if_newer(&self, snapshot: ClusterSnapshot) -> Result<bool, ClusterError> {
        let mut current = self.current.lock().await;
        if snapshot.version <= current.version {
            return Ok(false);
        }
        self.persist(&snapshot)?;
        *current = snapshot;
        Ok(true)
    }

    /// Adopt a snapshot unconditionally (joining a cluster).
    pub async fn adopt(&self, snapshot: ClusterSnapshot) -> Result<(), ClusterError> {
        let mut current = self.current.lock().await;
        self.persist(&snapshot)?;
        *current = snapshot;
        Ok(())
    }

    /// Forget the cluster entirely (this member left).
    pub async fn clear(&self) -> Result<(), ClusterError> {
        let mut current = self.current.lock().await;
        if let Some(path) = &self.path {
            flock_common::persist::remove_if_exists(path)?;
        }
        *current = ClusterSnapshot::default();
        Ok(())
    }

    fn persist(&self, snapshot: &ClusterSnapshot) -> Result<(), ClusterError> {
        if let Some(path) = &self.path {
            flock_common::persist::write_json_pretty(path, snapshot)?;
        }
        Ok(())
    }
}
