//! Cluster member rows and their derived live status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Voters kept before new members become stand-by.
pub const MAX_VOTERS: usize = 3;

/// Stand-by members kept before new members become spares.
pub const MAX_STANDBY: usize = 2;

/// Consensus role of a member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Voter,
    StandBy,
    Spare,
}

/// Stored lifecycle state of a member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Pending,
    Online,
    Offline,
    Evicted,
}

/// Live status shown to clients, derived from heartbeat freshness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberStatus {
    Online,
    Offline,
}

/// One row of the replicated node table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub id: i64,
    pub server_name: String,
    /// `host:port` of the member's HTTPS listener.
    pub address: String,
    pub role: MemberRole,
    pub state: MemberState,
    /// SHA-256 fingerprint of the member's TLS certificate.
    pub certificate: String,
    pub heartbeat: DateTime<Utc>,
}

impl Member {
    /// Live status: online while the last heartbeat is younger than
    /// `offline_threshold` and the row is not marked offline or evicted.
    pub fn status(&self, now: DateTime<Utc>, offline_threshold: Duration) -> MemberStatus {
        if matches!(self.state, MemberState::Offline | MemberState::Evicted) {
            return MemberStatus::Offline;
        }
        let age = now
            .signed_duration_since(self.heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < offline_threshold {
            MemberStatus::Online
        } else {
            MemberStatus::Offline
        }
    }

    pub fn is_database(&self) -> bool {
        self.role == MemberRole::Voter
    }
}

/// Role for a member about to join `existing`.
pub(crate) fn next_role(existing: &[Member]) -> MemberRole {
    let count = |role: MemberRole| {
        existing
            .iter()
            .filter(|m| m.role == role && m.state != MemberState::Evicted)
            .count()
    };
    if count(MemberRole::Voter) < MAX_VOTERS {
        MemberRole::Voter
    } else if count(MemberRole::StandBy) < MAX_STANDBY {
        MemberRole::StandBy
    } else {
        MemberRole::Spare
    }
}

/// Refill voter and stand-by slots after a removal, promoting in id order.
pub(crate) fn rebalance_roles(members: &mut [Member]) {
    for (from, to, limit) in [
        (MemberRole::StandBy, MemberRole::Voter, MAX_VOTERS),
        (MemberRole::Spare, MemberRole::StandBy, MAX_STANDBY),
    ] {
        let mut filled = members.iter().filter(|m| m.role == to).count();
        for member in members.iter_mut() {
            if filled >= limit {
                break;
            }
            if member.role == from && member.state != MemberState::Evicted {
                member.role = to;
                filled += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, name: &str, role: MemberRole) -> Member {
        Member {
            id,
            server_name: name.to_string(),
            address: format!("10.0.0.{id}:8443"),
            role,
            state: MemberState::Online,
            certificate: format!("fp-{id}"),
            heartbeat: Utc::now(),
        }
    }

    #[test]
    fn fresh_heartbeat_is_online() {
        let m = member(1, "a", MemberRole::Voter);
        assert_eq!(
            m.status(Utc::now(), Duration::from_secs(20)),
            MemberStatus::Online
        );
    }

    #[test]
    fn stale_heartbeat_is_offline() {
        let mut m = member(1, "a", MemberRole::Voter);
        m.heartbeat = Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(
            m.status(Utc::now(), Duration::from_secs(20)),
            MemberStatus::Offline
        );
    }

    #[test]
    fn offline_state_wins_over_fresh_heartbeat() {
        let mut m = member(1, "a", MemberRole::Voter);
        m.state = MemberState::Offline;
        assert_eq!(
            m.status(Utc::now(), Duration::from_secs(20)),
            MemberStatus::Offline
        );
    }

    #[test]
    fn roles_fill_voters_then_standby_then_spare() {
        let mut members = Vec::new();
        let mut roles = Vec::new();
        for id in 1..=7 {
            let role = next_role(&members);
            roles.push(role);
            members.push(member(id, &format!("n{id}"), role));
        }
        assert_eq!(
            roles,
            vec![
                MemberRole::Voter,
                MemberRole::Voter,
                MemberRole::Voter,
                MemberRole::StandBy,
                MemberRole::StandBy,
                MemberRole::Spare,
                MemberRole::Spare,
            ]
        );
    }

    #[test]
    fn rebalance_promotes_standby_after_voter_leaves() {
        let mut members = vec![
            member(2, "b", MemberRole::Voter),
            member(3, "c", MemberRole::Voter),
            member(4, "d", MemberRole::StandBy),
            member(5, "e", MemberRole::StandBy),
            member(6, "f", MemberRole::Spare),
        ];
        rebalance_roles(&mut members);
        assert_eq!(members[2].role, MemberRole::Voter);
        assert_eq!(members[3].role, MemberRole::StandBy);
        assert_eq!(members[4].role, MemberRole::StandBy);
    }
}
