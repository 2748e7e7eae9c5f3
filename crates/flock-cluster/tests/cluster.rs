//! Multi-member scenarios over the in-process network.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flock_cluster::config::{HTTPS_ADDRESS, MACAROON_ENDPOINT, TRUST_PASSWORD};
use flock_cluster::local::InProcessNetwork;
use flock_cluster::member::{MemberRole, MemberState, MemberStatus};
use flock_cluster::mutation::Mutation;
use flock_cluster::operation::OperationStatus;
use flock_cluster::protocol::{CertificatesPost, ClusterMemberPost, ClusterPut, ServerPut};
use flock_cluster::settings::ClusterSettings;
use flock_cluster::store::ClusterSnapshot;
use flock_cluster::transport::InternalRequest;
use flock_cluster::trust::{CertificateType, PeerIdentity};
use flock_cluster::{ClusterCore, ClusterCoreConfig, ClusterError, ClusterEvent};
use flock_common::error::ErrorCode;
use flock_crypto::identity::ServerIdentity;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const PASSWORD: &str = "sekret";

struct Node {
    core: ClusterCore,
    identity: ServerIdentity,
    address: String,
}

fn temp_data_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("flock-cluster-test-{nanos}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn fast_settings() -> ClusterSettings {
    ClusterSettings {
        notify_timeout_ms: 500,
        ..ClusterSettings::default()
    }
}

/// A networked daemon: HTTPS address and trust password configured.
async fn node(network: &InProcessNetwork, index: usize, settings: ClusterSettings) -> Node {
    let identity = ServerIdentity::generate(&format!("node{index}")).unwrap();
    let address = format!("10.0.0.{}:8443", index + 1);
    let core = ClusterCore::open(
        ClusterCoreConfig {
            identity: identity.clone(),
            data_dir: None,
            settings,
        },
        network.transport(&identity),
    )
    .unwrap();
    network.attach(&address, &core);

    let mut config = BTreeMap::new();
    config.insert(HTTPS_ADDRESS.to_string(), address.clone());
    config.insert(TRUST_PASSWORD.to_string(), PASSWORD.to_string());
    core.update_server(ServerPut { config }, None).await.unwrap();

    Node {
        core,
        identity,
        address,
    }
}

async fn bootstrap(node: &Node, name: &str) -> Result<(), ClusterError> {
    let put = ClusterPut {
        server_name: name.to_string(),
        enabled: true,
        ..ClusterPut::default()
    };
    node.core.update_cluster(put, None).await?.wait().await
}

/// Register `joiner`'s certificate on `target` with the trust password.
async fn trust(joiner: &Node, target: &Node, name: &str) -> Result<(), ClusterError> {
    let post = CertificatesPost {
        name: format!("flock.cluster.{name}"),
        kind: CertificateType::Client,
        certificate: String::new(),
        password: PASSWORD.to_string(),
    };
    let caller = PeerIdentity::from_certificate(joiner.identity.cert_der());
    target.core.register_certificate(post, &caller).await?;
    Ok(())
}

async fn join(joiner: &Node, target: &Node, name: &str) -> Result<(), ClusterError> {
    let put = ClusterPut {
        server_name: name.to_string(),
        enabled: true,
        cluster_address: target.address.clone(),
        cluster_certificate: target.identity.cert_pem().to_string(),
    };
    joiner.core.update_cluster(put, None).await?.wait().await
}

/// `count` members: node0 bootstraps, every other node joins through node0.
async fn cluster(network: &InProcessNetwork, count: usize, settings: ClusterSettings) -> Vec<Node> {
    let mut nodes = Vec::new();
    for i in 0..count {
        nodes.push(node(network, i, settings.clone()).await);
    }
    bootstrap(&nodes[0], "node0").await.unwrap();
    for i in 1..count {
        let name = format!("node{i}");
        trust(&nodes[i], &nodes[0], &name).await.unwrap();
        join(&nodes[i], &nodes[0], &name).await.unwrap();
    }
    nodes
}

// ── Bootstrap ───────────────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_enables_clustering() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;

    let before = n.core.get_cluster().await;
    assert_eq!(before.server_name, "");
    assert!(!before.enabled);

    bootstrap(&n, "buzz").await?;

    let after = n.core.get_cluster().await;
    assert_eq!(after.server_name, "buzz");
    assert!(after.enabled);

    let members = n.core.get_cluster_members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, 1);
    assert_eq!(members[0].address, n.address);
    assert_eq!(members[0].role, MemberRole::Voter);

    let ops = n.core.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Success);
    Ok(())
}

#[tokio::test]
async fn second_bootstrap_is_already_clustered() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;
    bootstrap(&n, "buzz").await?;

    let err = bootstrap(&n, "buzz").await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyClustered));
    Ok(())
}

#[tokio::test]
async fn unclustered_node_lists_itself_as_none() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;

    assert_eq!(
        n.core.get_cluster_member_names().await,
        vec!["/1.0/cluster/members/none".to_string()]
    );
    let none = n.core.get_cluster_member("none").await?;
    assert_eq!(none.status, MemberStatus::Online);
    assert_eq!(none.message, "fully operational");
    assert!(!none.database);
    Ok(())
}

#[tokio::test]
async fn disabling_through_put_is_rejected() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;
    let err = n
        .core
        .update_cluster(ClusterPut::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
    Ok(())
}

// ── Join ────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_node_join() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;

    let expected = vec![
        "/1.0/cluster/members/node0".to_string(),
        "/1.0/cluster/members/node1".to_string(),
    ];
    for n in &nodes {
        assert_eq!(n.core.get_cluster_member_names().await, expected);
        let members = n.core.get_cluster_members().await;
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.status == MemberStatus::Online));
        assert_eq!(members[1].id, 2);
    }

    let view = nodes[1].core.get_cluster().await;
    assert_eq!(view.server_name, "node1");
    assert!(view.enabled);
    Ok(())
}

#[tokio::test]
async fn join_without_trusted_certificate_is_not_authorized() -> TestResult {
    let network = InProcessNetwork::new();
    let n0 = node(&network, 0, fast_settings()).await;
    let n1 = node(&network, 1, fast_settings()).await;
    bootstrap(&n0, "node0").await?;

    let err = join(&n1, &n0, "node1").await.unwrap_err();
    assert_eq!(err.to_string(), "failed to request to add node: not authorized");
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    assert_eq!(n0.core.get_cluster_members().await.len(), 1);
    assert!(!n1.core.get_cluster().await.enabled);
    Ok(())
}

#[tokio::test]
async fn wrong_password_cannot_register() -> TestResult {
    let network = InProcessNetwork::new();
    let n0 = node(&network, 0, fast_settings()).await;
    let n1 = node(&network, 1, fast_settings()).await;

    let post = CertificatesPost {
        name: "intruder".to_string(),
        kind: CertificateType::Client,
        certificate: String::new(),
        password: "guess".to_string(),
    };
    let caller = PeerIdentity::from_certificate(n1.identity.cert_der());
    let err = n0.core.register_certificate(post, &caller).await.unwrap_err();
    assert!(matches!(err, ClusterError::Unauthorized));
    assert!(!n0.core.is_authorized(n1.identity.fingerprint()).await);
    Ok(())
}

#[tokio::test]
async fn join_through_non_leader_is_forwarded() -> TestResult {
    let network = InProcessNetwork::new();
    let mut nodes = cluster(&network, 2, fast_settings()).await;
    let n2 = node(&network, 2, fast_settings()).await;
    trust(&n2, &nodes[1], "node2").await?;
    join(&n2, &nodes[1], "node2").await?;
    nodes.push(n2);

    for n in &nodes {
        let members = n.core.get_cluster_members().await;
        let names: Vec<&str> = members.iter().map(|m| m.server_name.as_str()).collect();
        assert_eq!(names, vec!["node0", "node1", "node2"]);
    }
    // Members authorize each other without trust-store entries.
    assert!(nodes[0].core.is_authorized(nodes[2].identity.fingerprint()).await);
    Ok(())
}

#[tokio::test]
async fn concurrent_joins_with_same_name_conflict() -> TestResult {
    let network = InProcessNetwork::new();
    let n0 = node(&network, 0, fast_settings()).await;
    let n1 = node(&network, 1, fast_settings()).await;
    let n2 = node(&network, 2, fast_settings()).await;
    bootstrap(&n0, "node0").await?;
    trust(&n1, &n0, "dup").await?;
    trust(&n2, &n0, "dup").await?;

    let (a, b) = tokio::join!(join(&n1, &n0, "dup"), join(&n2, &n0, "dup"));
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.code(), ErrorCode::Conflict);

    let names = n0.core.get_cluster_member_names().await;
    assert_eq!(names.len(), 2);
    Ok(())
}

#[tokio::test]
async fn join_emits_member_joined_on_leader() -> TestResult {
    let network = InProcessNetwork::new();
    let n0 = node(&network, 0, fast_settings()).await;
    let n1 = node(&network, 1, fast_settings()).await;
    bootstrap(&n0, "node0").await?;

    let mut rx = n0.core.subscribe();
    trust(&n1, &n0, "node1").await?;
    join(&n1, &n0, "node1").await?;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;
    assert_eq!(
        event,
        ClusterEvent::MemberJoined {
            server_name: "node1".to_string(),
            id: 2
        }
    );
    Ok(())
}

#[tokio::test]
async fn joining_member_receives_cluster_config() -> TestResult {
    let network = InProcessNetwork::new();
    let n0 = node(&network, 0, fast_settings()).await;
    let n1 = node(&network, 1, fast_settings()).await;
    bootstrap(&n0, "node0").await?;

    let (view, etag) = n0.core.get_server(true).await?;
    let mut config = view.config;
    config.insert(MACAROON_ENDPOINT.to_string(), "foo.bar".to_string());
    n0.core.update_server(ServerPut { config }, Some(&etag)).await?;

    trust(&n1, &n0, "node1").await?;
    join(&n1, &n0, "node1").await?;

    let (view, _) = n1.core.get_server(true).await?;
    assert_eq!(view.config[MACAROON_ENDPOINT], "foo.bar");
    assert_eq!(view.config[HTTPS_ADDRESS], n1.address);
    Ok(())
}

// ── Config notification ─────────────────────────────────────────────

#[tokio::test]
async fn config_change_reaches_every_member() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;

    let (view, etag) = nodes[0].core.get_server(true).await?;
    let mut config = view.config;
    config.insert(MACAROON_ENDPOINT.to_string(), "http://example.com/".to_string());
    nodes[0]
        .core
        .update_server(ServerPut { config }, Some(&etag))
        .await?;

    for n in &nodes {
        let (view, _) = n.core.get_server(true).await?;
        assert_eq!(view.config[MACAROON_ENDPOINT], "http://example.com/");
        // Node-local address is untouched by the notification.
        assert_eq!(view.config[HTTPS_ADDRESS], n.address);
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_member_does_not_fail_config_update() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;
    network.partition(&nodes[2].address);

    let (view, _) = nodes[0].core.get_server(true).await?;
    let mut config = view.config;
    config.insert("user.motd".to_string(), "hello".to_string());
    nodes[0].core.update_server(ServerPut { config }, None).await?;

    let (on_peer, _) = nodes[1].core.get_server(true).await?;
    assert_eq!(on_peer.config["user.motd"], "hello");
    let (on_partitioned, _) = nodes[2].core.get_server(true).await?;
    assert!(!on_partitioned.config.contains_key("user.motd"));
    Ok(())
}

#[tokio::test]
async fn stale_etag_is_rejected() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;
    let (view, etag) = n.core.get_server(true).await?;

    let mut first = view.config.clone();
    first.insert("user.a".to_string(), "1".to_string());
    n.core.update_server(ServerPut { config: first }, Some(&etag)).await?;

    let mut second = view.config;
    second.insert("user.a".to_string(), "2".to_string());
    let err = n
        .core
        .update_server(ServerPut { config: second }, Some(&etag))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EtagMismatch);
    assert!(err.to_string().starts_with("ETag doesn't match: "));
    Ok(())
}

#[tokio::test]
async fn https_address_cannot_change_while_clustered() -> TestResult {
    let network = InProcessNetwork::new();
    let n = node(&network, 0, fast_settings()).await;
    bootstrap(&n, "node0").await?;

    let (view, _) = n.core.get_server(true).await?;
    let mut config = view.config;
    config.insert(HTTPS_ADDRESS.to_string(), "10.0.0.99:8443".to_string());
    let err = n
        .core
        .update_server(ServerPut { config }, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
    Ok(())
}

// ── Leave ───────────────────────────────────────────────────────────

#[tokio::test]
async fn leave_is_blocked_by_sole_owned_image() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;
    nodes[1].core.associate_resource("abc").await?;

    let err = nodes[0]
        .core
        .delete_cluster_member("node1", false)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "node still has the following images: abc");
    assert_eq!(err.code(), ErrorCode::ResourceConflict);
    assert_eq!(nodes[0].core.get_cluster_members().await.len(), 2);

    nodes[0].core.associate_resource("abc").await?;
    nodes[0].core.delete_cluster_member("node1", false).await?;

    assert_eq!(
        nodes[0].core.get_cluster_member_names().await,
        vec!["/1.0/cluster/members/node0".to_string()]
    );
    let images = nodes[0].core.list_resources().await;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].members, vec!["node0".to_string()]);

    // The removed member learned it is out.
    assert!(!nodes[1].core.get_cluster().await.enabled);
    assert_eq!(
        nodes[1].core.get_cluster_member_names().await,
        vec!["/1.0/cluster/members/none".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn forced_leave_deletes_sole_owned_image() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;
    nodes[1].core.associate_resource("abc").await?;

    nodes[0].core.delete_cluster_member("node1", true).await?;

    assert!(nodes[0].core.list_resources().await.is_empty());
    assert_eq!(nodes[0].core.get_cluster_members().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn member_can_remove_itself() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;
    let mut rx = nodes[2].core.subscribe();

    nodes[2].core.delete_cluster_member("node2", false).await?;

    assert!(!nodes[2].core.get_cluster().await.enabled);
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;
    assert_eq!(event, ClusterEvent::LeftCluster);
    for n in &nodes[..2] {
        assert_eq!(n.core.get_cluster_members().await.len(), 2);
    }
    Ok(())
}

#[tokio::test]
async fn leave_unknown_member_is_not_found() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 1, fast_settings()).await;
    let err = nodes[0]
        .core
        .delete_cluster_member("ghost", true)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    Ok(())
}

#[tokio::test]
async fn removing_a_voter_promotes_the_next_member() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 4, fast_settings()).await;
    let roles: Vec<MemberRole> = nodes[0]
        .core
        .get_cluster_members()
        .await
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(
        roles,
        vec![MemberRole::Voter, MemberRole::Voter, MemberRole::Voter, MemberRole::StandBy]
    );

    nodes[0].core.delete_cluster_member("node1", false).await?;
    let node3 = nodes[0].core.get_cluster_member("node3").await?;
    assert_eq!(node3.role, MemberRole::Voter);
    assert!(node3.database);
    Ok(())
}

// ── Rename ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rename_keeps_id_and_role() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;
    let before = nodes[0].core.get_cluster_member("node1").await?;

    nodes[0]
        .core
        .rename_cluster_member(
            "node1",
            ClusterMemberPost {
                server_name: "rusp".to_string(),
            },
        )
        .await?;

    let after = nodes[0].core.get_cluster_member("rusp").await?;
    assert_eq!(after.id, before.id);
    assert_eq!(after.role, before.role);
    assert_eq!(after.url, "/1.0/cluster/members/rusp");

    let err = nodes[0].core.get_cluster_member("node1").await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));

    // Replicated to the renamed member itself.
    assert_eq!(nodes[1].core.get_cluster().await.server_name, "rusp");
    Ok(())
}

#[tokio::test]
async fn rename_to_existing_name_conflicts() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;
    let err = nodes[1]
        .core
        .rename_cluster_member(
            "node1",
            ClusterMemberPost {
                server_name: "node0".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(err.to_string(), "member name already in use: node0");

    let err = nodes[1]
        .core
        .rename_cluster_member(
            "ghost",
            ClusterMemberPost {
                server_name: "x".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    Ok(())
}

// ── Heartbeat ───────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_marks_unreachable_member_offline() -> TestResult {
    let network = InProcessNetwork::new();
    let settings = ClusterSettings {
        offline_threshold_ms: 200,
        notify_timeout_ms: 100,
        ..ClusterSettings::default()
    };
    let nodes = cluster(&network, 2, settings).await;

    // Only the leader sends heartbeats.
    assert!(nodes[1].core.heartbeat_once().await?.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    network.partition(&nodes[1].address);
    let report = nodes[0].core.heartbeat_once().await?.unwrap();
    assert_eq!(report.failed.len(), 1);

    let members = nodes[0].core.get_cluster_members().await;
    assert_eq!(members[0].status, MemberStatus::Online);
    assert_eq!(members[1].status, MemberStatus::Offline);
    assert_eq!(members[1].state, MemberState::Offline);

    network.heal(&nodes[1].address);
    let report = nodes[0].core.heartbeat_once().await?.unwrap();
    assert!(report.all_delivered());
    let members = nodes[0].core.get_cluster_members().await;
    assert_eq!(members[1].status, MemberStatus::Online);
    Ok(())
}

#[tokio::test]
async fn followers_see_fresh_status_after_heartbeat() -> TestResult {
    let network = InProcessNetwork::new();
    let settings = ClusterSettings {
        offline_threshold_ms: 300,
        notify_timeout_ms: 100,
        ..ClusterSettings::default()
    };
    let nodes = cluster(&network, 2, settings).await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    let report = nodes[0].core.heartbeat_once().await?.unwrap();
    assert!(report.all_delivered());

    for n in &nodes {
        let members = n.core.get_cluster_members().await;
        assert!(
            members.iter().all(|m| m.status == MemberStatus::Online),
            "{:?}",
            members
                .iter()
                .map(|m| (m.server_name.clone(), m.status))
                .collect::<Vec<_>>()
        );
    }
    Ok(())
}

// ── Internal API ────────────────────────────────────────────────────

fn forged_table() -> ClusterSnapshot {
    ClusterSnapshot {
        version: 1000,
        ..ClusterSnapshot::default()
    }
}

#[tokio::test]
async fn registered_client_cannot_push_node_table() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 2, fast_settings()).await;

    let admin = ServerIdentity::generate("admin")?;
    let caller = PeerIdentity::from_certificate(admin.cert_der());
    let post = CertificatesPost {
        name: "admin".to_string(),
        kind: CertificateType::Client,
        certificate: String::new(),
        password: PASSWORD.to_string(),
    };
    nodes[1].core.register_certificate(post, &caller).await?;

    for request in [
        InternalRequest::Replicate {
            snapshot: forged_table(),
        },
        InternalRequest::Heartbeat {
            snapshot: forged_table(),
        },
    ] {
        let err = nodes[1].core.handle_internal(&caller, request).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unauthorized));
    }
    let err = nodes[1]
        .core
        .handle_internal(
            &caller,
            InternalRequest::Notify {
                changes: BTreeMap::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Unauthorized));

    assert!(nodes[1].core.get_cluster().await.enabled);
    assert_eq!(nodes[1].core.get_cluster_members().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn only_the_leader_pushes_node_tables() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;

    let follower = PeerIdentity::from_certificate(nodes[2].identity.cert_der());
    let err = nodes[1]
        .core
        .handle_internal(
            &follower,
            InternalRequest::Replicate {
                snapshot: forged_table(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Unauthorized));
    assert_eq!(nodes[1].core.get_cluster_members().await.len(), 3);

    // Members may still forward writes and ping each other.
    nodes[2]
        .core
        .rename_cluster_member(
            "node2",
            ClusterMemberPost {
                server_name: "node2b".to_string(),
            },
        )
        .await?;
    assert!(nodes[1].core.get_cluster_member("node2b").await.is_ok());
    Ok(())
}

// ── Leader failure ──────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_leader_is_removed_by_its_successor() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;
    network.partition(&nodes[0].address);

    // Without force the removal still has to go through the leader.
    let err = nodes[2]
        .core
        .delete_cluster_member("node0", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NetworkError);

    nodes[2].core.delete_cluster_member("node0", true).await?;

    for n in &nodes[1..] {
        let names: Vec<String> = n
            .core
            .get_cluster_members()
            .await
            .into_iter()
            .map(|m| m.server_name)
            .collect();
        assert_eq!(names, vec!["node1".to_string(), "node2".to_string()]);
    }

    // node1 now leads: it heartbeats and commits further writes.
    assert!(nodes[2].core.heartbeat_once().await?.is_none());
    let report = nodes[1].core.heartbeat_once().await?.unwrap();
    assert!(report.all_delivered());
    nodes[2]
        .core
        .rename_cluster_member(
            "node2",
            ClusterMemberPost {
                server_name: "node2b".to_string(),
            },
        )
        .await?;
    assert!(nodes[1].core.get_cluster_member("node2b").await.is_ok());
    Ok(())
}

#[tokio::test]
async fn successor_refuses_to_evict_a_reachable_leader() -> TestResult {
    let network = InProcessNetwork::new();
    let nodes = cluster(&network, 3, fast_settings()).await;

    let follower = PeerIdentity::from_certificate(nodes[2].identity.cert_der());
    let request = InternalRequest::Mutate {
        mutation: Mutation::Remove {
            name: "node0".to_string(),
            force: true,
        },
    };
    let err = nodes[1].core.handle_internal(&follower, request).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    assert_eq!(nodes[0].core.get_cluster_members().await.len(), 3);
    Ok(())
}

// ── Persistence ─────────────────────────────────────────────────────

#[tokio::test]
async fn membership_survives_restart() -> TestResult {
    let data_dir = temp_data_dir();
    let identity = ServerIdentity::load_or_generate(&data_dir, "node0")?;
    let network = InProcessNetwork::new();

    let open = |identity: ServerIdentity| {
        ClusterCore::open(
            ClusterCoreConfig {
                identity: identity.clone(),
                data_dir: Some(data_dir.clone()),
                settings: fast_settings(),
            },
            network.transport(&identity),
        )
    };

    let core = open(identity.clone())?;
    let mut config = BTreeMap::new();
    config.insert(HTTPS_ADDRESS.to_string(), "10.0.0.1:8443".to_string());
    core.update_server(ServerPut { config }, None).await?;
    core.update_cluster(
        ClusterPut {
            server_name: "buzz".to_string(),
            enabled: true,
            ..ClusterPut::default()
        },
        None,
    )
    .await?
    .wait()
    .await?;
    drop(core);

    let reopened = open(ServerIdentity::load_or_generate(&data_dir, "node0")?)?;
    let view = reopened.get_cluster().await;
    assert_eq!(view.server_name, "buzz");
    assert!(view.enabled);
    assert_eq!(reopened.https_address().await.as_deref(), Some("10.0.0.1:8443"));

    let audit = std::fs::read_to_string(data_dir.join("logs").join("cluster-audit.log"))?;
    assert!(audit.contains("cluster_bootstrapped | name=buzz"));

    let _ = std::fs::remove_dir_all(&data_dir);
    Ok(())
}
