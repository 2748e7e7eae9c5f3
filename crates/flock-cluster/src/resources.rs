//! Which members hold a copy of which shared resource (images).
//!
//! Consulted when a member leaves: a member may not leave while it is the
//! only holder of a resource unless the removal is forced, in which case
//! the orphaned resources are deleted with it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ResourceTable {
    holders: BTreeMap<String, BTreeSet<i64>>,
}

impl ResourceTable {
    /// Create `resource` with `member` as its first holder.
    pub fn insert(&mut self, resource: &str, member: i64) -> Result<(), ClusterError> {
        if self.holders.contains_key(resource) {
            return Err(ClusterError::Conflict(format!(
                "image already exists: {resource}"
            )));
        }
        self.holders
            .insert(resource.to_string(), BTreeSet::from([member]));
        Ok(())
    }

    /// Record that `member` holds `resource`, creating the resource if new.
    /// Returns `false` if the association already existed.
    pub fn associate(&mut self, resource: &str, member: i64) -> bool {
        self.holders
            .entry(resource.to_string())
            .or_default()
            .insert(member)
    }

    /// Drop `member` from `resource`. The resource itself is deleted when
    /// its last holder goes; returns `true` in that case.
    pub fn disassociate(&mut self, resource: &str, member: i64) -> Result<bool, ClusterError> {
        let holders = self
            .holders
            .get_mut(resource)
            .filter(|h| h.contains(&member))
            .ok_or_else(|| ClusterError::NotFound(format!("image not found: {resource}")))?;
        holders.remove(&member);
        if holders.is_empty() {
            self.holders.remove(resource);
            return Ok(true);
        }
        Ok(false)
    }

    /// Resources whose only holder is `member`.
    pub fn sole_owned_by(&self, member: i64) -> BTreeSet<String> {
        self.holders
            .iter()
            .filter(|(_, holders)| holders.len() == 1 && holders.contains(&member))
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    /// Remove `member` from every resource; returns the resources that
    /// were deleted because it was their last holder.
    pub fn remove_member(&mut self, member: i64) -> Vec<String> {
        let mut deleted = Vec::new();
        self.holders.retain(|resource, holders| {
            holders.remove(&member);
            if holders.is_empty() {
                deleted.push(resource.clone());
                false
            } else {
                true
            }
        });
        deleted
    }

    pub fn holders(&self, resource: &str) -> Option<&BTreeSet<i64>> {
        self.holders.get(resource)
    }

    /// Every resource with its holders, sorted by resource id.
    pub fn list(&self) -> Vec<(String, Vec<i64>)> {
        self.holders
            .iter()
            .map(|(resource, holders)| (resource.clone(), holders.iter().copied().collect()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<i64>)> {
        self.holders.iter()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
