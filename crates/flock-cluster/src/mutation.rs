//! Node-table writes, executed by the leader inside a store transaction.
//!
//! A mutation is plain data so that a non-leader can forward it over the
//! wire and the leader can apply it unchanged.

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::member::{Member, MemberState};
use crate::store::{NewMember, NodeTx};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Append a joining member.
    Accept {
        server_name: String,
        address: String,
        certificate: String,
    },
    Rename {
        from: String,
        to: String,
    },
    /// Remove a member; `force` deletes the resources only it holds.
    Remove {
        name: String,
        force: bool,
    },
    Associate {
        resource: String,
        member_id: i64,
    },
    Disassociate {
        resource: String,
        member_id: i64,
    },
}

#[derive(Debug, Clone)]
pub enum MutationOutcome {
    Accepted(Member),
    Renamed { from: String, member: Member },
    Removed { member: Member, deleted: Vec<String> },
    Resource,
}

impl Mutation {
    /// Whether this is a forced removal of `server_name`, the only write
    /// another member may commit while the leader is unreachable.
    pub fn evicts(&self, server_name: &str) -> bool {
        matches!(self, Mutation::Remove { name, force: true } if name == server_name)
    }

    pub fn apply(&self, tx: &mut NodeTx<'_>) -> Result<MutationOutcome, ClusterError> {
        match self {
            Mutation::Accept {
                server_name,
                address,
                certificate,
            } => {
                let member = tx.add_member(NewMember {
                    server_name: server_name.clone(),
                    address: address.clone(),
                    certificate: certificate.clone(),
                })?;
                Ok(MutationOutcome::Accepted(member))
            }
            Mutation::Rename { from, to } => {
                let member = tx.rename_member(from, to)?;
                Ok(MutationOutcome::Renamed {
                    from: from.clone(),
                    member,
                })
            }
            Mutation::Remove { name, force } => {
                let target = tx
                    .snapshot()
                    .member_by_name(name)
                    .cloned()
                    .ok_or_else(|| ClusterError::NotFound(format!("member not found: {name}")))?;

                if !force && target.state != MemberState::Evicted {
                    let sole = tx.snapshot().resources.sole_owned_by(target.id);
                    if !sole.is_empty() {
                        return Err(ClusterError::ResourceConflict(sole.into_iter().collect()));
                    }
                }

                let member = tx.remove_member(name)?;
                let deleted = tx.resources().remove_member(member.id);
                Ok(MutationOutcome::Removed { member, deleted })
            }
            Mutation::Associate {
                resource,
                member_id,
            } => {
                require_member(tx, *member_id)?;
                tx.resources().associate(resource, *member_id);
                Ok(MutationOutcome::Resource)
            }
            Mutation::Disassociate {
                resource,
                member_id,
            } => {
                tx.resources().disassociate(resource, *member_id)?;
                Ok(MutationOutcome::Resource)
            }
        }
    }
}

fn require_member(tx: &NodeTx<'_>, id: i64) -> Result<(), ClusterError> {
    tx.snapshot()
        .member_by_id(id)
        .map(|_| ())
        .ok_or_else(|| ClusterError::NotFound(format!("member not found: {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MembershipStore;

    async fn store_with(names: &[&str]) -> MembershipStore {
        let store = MembershipStore::open(None).unwrap();
        for (i, name) in names.iter().enumerate() {
            let accept = Mutation::Accept {
                server_name: name.to_string(),
                address: format!("10.0.0.{}:8443", i + 1),
                certificate: format!("fp-{name}"),
            };
            store.transaction(|tx| accept.apply(tx)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn remove_refuses_sole_owner_unless_forced() {
        let store = store_with(&["node0", "node1"]).await;
        let associate = Mutation::Associate {
            resource: "abc".into(),
            member_id: 2,
        };
        store.transaction(|tx| associate.apply(tx)).await.unwrap();

        let remove = Mutation::Remove {
            name: "node1".into(),
            force: false,
        };
        let err = store.transaction(|tx| remove.apply(tx)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "node still has the following images: abc"
        );
        assert_eq!(store.snapshot().await.members.len(), 2);

        let forced = Mutation::Remove {
            name: "node1".into(),
            force: true,
        };
        let (outcome, snapshot) = store.transaction(|tx| forced.apply(tx)).await.unwrap();
        match outcome {
            MutationOutcome::Removed { member, deleted } => {
                assert_eq!(member.server_name, "node1");
                assert_eq!(deleted, vec!["abc".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(snapshot.resources.is_empty());
    }

    #[tokio::test]
    async fn shared_resource_does_not_block_removal() {
        let store = store_with(&["node0", "node1"]).await;
        for member_id in [1, 2] {
            let associate = Mutation::Associate {
                resource: "abc".into(),
                member_id,
            };
            store.transaction(|tx| associate.apply(tx)).await.unwrap();
        }
        let remove = Mutation::Remove {
            name: "node1".into(),
            force: false,
        };
        let (_, snapshot) = store.transaction(|tx| remove.apply(tx)).await.unwrap();
        assert_eq!(snapshot.resources_of(1), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn evicted_member_skips_resource_check() {
        let store = store_with(&["node0", "node1"]).await;
        let associate = Mutation::Associate {
            resource: "abc".into(),
            member_id: 2,
        };
        store.transaction(|tx| associate.apply(tx)).await.unwrap();
        store
            .transaction(|tx| {
                tx.set_state(2, MemberState::Evicted);
                Ok(())
            })
            .await
            .unwrap();

        let remove = Mutation::Remove {
            name: "node1".into(),
            force: false,
        };
        assert!(store.transaction(|tx| remove.apply(tx)).await.is_ok());
    }

    #[tokio::test]
    async fn associate_unknown_member_is_not_found() {
        let store = store_with(&["node0"]).await;
        let associate = Mutation::Associate {
            resource: "abc".into(),
            member_id: 7,
        };
        let err = store.transaction(|tx| associate.apply(tx)).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[test]
    fn wire_form_is_tagged() {
        let json = serde_json::to_value(Mutation::Rename {
            from: "a".into(),
            to: "b".into(),
        })
        .unwrap();
        assert_eq!(json["op"], "rename");
    }

    #[test]
    fn only_forced_removal_evicts() {
        let forced = Mutation::Remove {
            name: "node0".into(),
            force: true,
        };
        assert!(forced.evicts("node0"));
        assert!(!forced.evicts("node1"));

        let plain = Mutation::Remove {
            name: "node0".into(),
            force: false,
        };
        assert!(!plain.evicts("node0"));
        let rename = Mutation::Rename {
            from: "node0".into(),
            to: "x".into(),
        };
        assert!(!rename.evicts("node0"));
    }
}
