//! `flock cluster ...`

use std::path::Path;

use flock_cluster::protocol::ClusterPut;

use super::{client, explain, print_json, read_pem};
use crate::format;

pub async fn show(socket: &Path, json: bool) -> anyhow::Result<()> {
    let client = client(socket);
    let view = client.cluster().await.map_err(explain)?;
    if json {
        return print_json(&view);
    }
    let (server, _) = client.server().await.map_err(explain)?;
    format::cluster_summary(&view, &server);
    Ok(())
}

pub async fn list(socket: &Path, json: bool) -> anyhow::Result<()> {
    let members = client(socket).members().await.map_err(explain)?;
    if json {
        return print_json(&members);
    }
    format::member_table(&members);
    Ok(())
}

pub async fn bootstrap(socket: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let client = client(socket);
    let put = ClusterPut {
        server_name: name.to_string(),
        enabled: true,
        ..ClusterPut::default()
    };
    let op = client.update_cluster(&put).await.map_err(explain)?;
    let done = client.wait_success(&op).await.map_err(explain)?;
    if json {
        return print_json(&done);
    }
    format::operation_done(&done, &format!("Cluster bootstrapped as {name}"));
    Ok(())
}

pub async fn join(
    socket: &Path,
    name: &str,
    address: &str,
    certificate: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let client = client(socket);
    let put = ClusterPut {
        server_name: name.to_string(),
        enabled: true,
        cluster_address: address.to_string(),
        cluster_certificate: read_pem(certificate)?,
    };
    let op = client.update_cluster(&put).await.map_err(explain)?;
    let done = client.wait_success(&op).await.map_err(explain)?;
    if json {
        return print_json(&done);
    }
    format::operation_done(&done, &format!("Joined cluster via {address} as {name}"));
    Ok(())
}

pub async fn rename(socket: &Path, name: &str, new_name: &str, json: bool) -> anyhow::Result<()> {
    let client = client(socket);
    client.rename_member(name, new_name).await.map_err(explain)?;
    if json {
        let member = client.member(new_name).await.map_err(explain)?;
        return print_json(&member);
    }
    println!("Renamed {name} to {new_name}");
    Ok(())
}

pub async fn remove(socket: &Path, name: &str, force: bool, json: bool) -> anyhow::Result<()> {
    client(socket)
        .remove_member(name, force)
        .await
        .map_err(explain)?;
    if json {
        return print_json(&serde_json::json!({ "removed": name }));
    }
    println!("Removed {name}");
    Ok(())
}
