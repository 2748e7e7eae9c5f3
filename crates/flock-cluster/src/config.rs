//! Server configuration keys (`GET|PUT /1.0`).
//!
//! Most keys are cluster-wide: a change on one member is pushed to every
//! other member. `core.https_address` is node-local and never leaves the
//! node. The trust password is stored as a hash and rendered as `"true"`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use flock_crypto::password::hash_password;

use crate::error::ClusterError;

pub const HTTPS_ADDRESS: &str = "core.https_address";
pub const TRUST_PASSWORD: &str = "core.trust_password";
pub const MACAROON_ENDPOINT: &str = "core.macaroon.endpoint";
pub const PROXY_HTTP: &str = "core.proxy_http";
pub const PROXY_HTTPS: &str = "core.proxy_https";
pub const IMAGES_AUTO_UPDATE_INTERVAL: &str = "images.auto_update_interval";

/// Placeholder shown instead of the stored password hash.
const REDACTED: &str = "true";

/// Key -> new stored value, `None` when the key was unset.
pub type ConfigChanges = BTreeMap<String, Option<String>>;

pub fn is_node_local(key: &str) -> bool {
    key == HTTPS_ADDRESS
}

fn validate(key: &str, value: &str) -> Result<(), ClusterError> {
    match key {
        HTTPS_ADDRESS => validate_address(value),
        IMAGES_AUTO_UPDATE_INTERVAL => value.parse::<u64>().map(|_| ()).map_err(|_| {
            ClusterError::InvalidPayload(format!(
                "invalid value for {key}: expected an unsigned integer"
            ))
        }),
        TRUST_PASSWORD | MACAROON_ENDPOINT | PROXY_HTTP | PROXY_HTTPS => Ok(()),
        k if k.starts_with("user.") => Ok(()),
        _ => Err(ClusterError::InvalidPayload(format!(
            "unknown configuration key: {key}"
        ))),
    }
}

fn validate_address(value: &str) -> Result<(), ClusterError> {
    let invalid = || {
        ClusterError::InvalidPayload(format!(
            "invalid value for {HTTPS_ADDRESS}: expected host:port, got {value:?}"
        ))
    };
    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

/// The node's configuration, persisted to `<data>/state/config.json`.
pub struct ServerConfig {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn open(path: Option<PathBuf>) -> Result<Self, ClusterError> {
        let values = match &path {
            Some(p) => flock_common::persist::read_json_if_exists::<BTreeMap<String, String>>(p)?
                .unwrap_or_default(),
            None => BTreeMap::new(),
        };
        Ok(Self { path, values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn https_address(&self) -> Option<&str> {
        self.get(HTTPS_ADDRESS)
    }

    pub fn trust_password_hash(&self) -> Option<&str> {
        self.get(TRUST_PASSWORD)
    }

    /// The config as shown to clients.
    pub fn rendered(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if k == TRUST_PASSWORD { REDACTED } else { v.as_str() };
                (k.clone(), shown.to_string())
            })
            .collect()
    }

    /// Replace the whole config with `requested` (a `PUT`).
    ///
    /// Empty values unset their key. A trust password equal to the
    /// rendered placeholder keeps the stored hash. Returns what changed.
    pub fn replace(
        &mut self,
        requested: &BTreeMap<String, String>,
        clustered: bool,
    ) -> Result<ConfigChanges, ClusterError> {
        let mut next = BTreeMap::new();
        for (key, value) in requested {
            validate(key, value)?;
            if value.is_empty() {
                continue;
            }
            let stored = match (key.as_str(), self.trust_password_hash()) {
                (TRUST_PASSWORD, Some(hash)) if value == REDACTED => hash.to_string(),
                (TRUST_PASSWORD, _) => hash_password(value)?,
                _ => value.clone(),
            };
            next.insert(key.clone(), stored);
        }

        if clustered && next.get(HTTPS_ADDRESS) != self.values.get(HTTPS_ADDRESS) {
            return Err(ClusterError::InvalidPayload(format!(
                "{HTTPS_ADDRESS} cannot be changed while clustered"
            )));
        }

        let changes = diff(&self.values, &next);
        if !changes.is_empty() {
            self.persist(&next)?;
            self.values = next;
        }
        Ok(changes)
    }

    /// Apply changes pushed by another member. Node-local keys are ignored.
    /// Returns the keys that actually changed.
    pub fn apply_changes(&mut self, changes: &ConfigChanges) -> Result<Vec<String>, ClusterError> {
        let mut next = self.values.clone();
        for (key, value) in changes.iter().filter(|(k, _)| !is_node_local(k)) {
            match value {
                Some(v) => next.insert(key.clone(), v.clone()),
                None => next.remove(key),
            };
        }
        let applied: Vec<String> = diff(&self.values, &next).into_keys().collect();
        if !applied.is_empty() {
            self.persist(&next)?;
            self.values = next;
        }
        Ok(applied)
    }

    /// Stored values of every cluster-wide key, as sent to a joining member.
    pub fn shared(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| !is_node_local(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Take over the cluster's shared keys on join. Node-local keys stay;
    /// cluster-wide keys absent from `shared` are unset.
    pub fn adopt_shared(&mut self, shared: &BTreeMap<String, String>) -> Result<Vec<String>, ClusterError> {
        let mut changes: ConfigChanges = shared
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for key in self.values.keys().filter(|k| !shared.contains_key(*k)) {
            changes.insert(key.clone(), None);
        }
        self.apply_changes(&changes)
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), ClusterError> {
        if let Some(path) = &self.path {
            flock_common::persist::write_json_pretty(path, values)?;
        }
        Ok(())
    }
}

fn diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> ConfigChanges {
    let mut changes = ConfigChanges::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        changes.insert(key.clone(), None);
    }
    changes
}

/// Only the cluster-wide part of `changes`.
pub fn cluster_wide(changes: &ConfigChanges) -> ConfigChanges {
    changes
        .iter()
        .filter(|(k, _)| !is_node_local(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
