//! `flock config ...`

use std::collections::BTreeMap;
use std::path::Path;

use flock_cluster::protocol::ServerPut;

use super::{client, explain, print_json};
use crate::format;

pub async fn show(socket: &Path, json: bool) -> anyhow::Result<()> {
    let (view, _) = client(socket).server().await.map_err(explain)?;
    if json {
        return print_json(&view);
    }
    format::config_table(&view.config);
    Ok(())
}

/// Read-modify-write with `If-Match`, so a concurrent change is refused
/// instead of overwritten.
pub async fn set(socket: &Path, pairs: &[String], json: bool) -> anyhow::Result<()> {
    let updates = parse_pairs(pairs)?;
    let client = client(socket);
    let (view, etag) = client.server().await.map_err(explain)?;

    let mut config = view.config;
    for (key, value) in updates {
        if value.is_empty() {
            config.remove(&key);
        } else {
            config.insert(key, value);
        }
    }
    client
        .update_server(&ServerPut { config }, Some(&etag))
        .await
        .map_err(explain)?;

    let (view, _) = client.server().await.map_err(explain)?;
    if json {
        return print_json(&view.config);
    }
    format::config_table(&view.config);
    Ok(())
}

fn parse_pairs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => anyhow::bail!("expected KEY=VALUE, got {pair:?}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_first_equals() {
        let parsed = parse_pairs(&[
            "core.https_address=10.0.0.1:8443".to_string(),
            "user.motd=a=b".to_string(),
            "core.trust_password=".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["core.https_address"], "10.0.0.1:8443");
        assert_eq!(parsed["user.motd"], "a=b");
        assert_eq!(parsed["core.trust_password"], "");
    }

    #[test]
    fn pair_without_key_is_rejected() {
        assert!(parse_pairs(&["=x".to_string()]).is_err());
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
    }
}
