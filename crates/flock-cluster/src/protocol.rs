//! REST request and response bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::member::{MemberRole, MemberState, MemberStatus};
use crate::trust::CertificateType;

/// `PUT /1.0/cluster` body. Empty `cluster_address` bootstraps, a set one joins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterPut {
    pub server_name: String,
    pub enabled: bool,
    /// `host:port` of an existing member to join through.
    pub cluster_address: String,
    /// PEM certificate of the join target, pinned during the join.
    pub cluster_certificate: String,
}

/// `GET /1.0/cluster` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterView {
    pub server_name: String,
    pub enabled: bool,
}

/// `POST /1.0/cluster/members/<name>` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMemberPost {
    pub server_name: String,
}

/// One member as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberView {
    pub server_name: String,
    pub url: String,
    /// Whether the member holds a voting copy of the node table.
    pub database: bool,
    pub status: MemberStatus,
    pub message: String,
    pub id: i64,
    pub address: String,
    pub role: MemberRole,
    pub state: MemberState,
}

/// `POST /1.0/certificates` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CertificateType,
    /// Base64 DER; empty means "the certificate I am connecting with".
    pub certificate: String,
    pub password: String,
}

/// `PUT /1.0` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPut {
    pub config: BTreeMap<String, String>,
}

/// `GET /1.0` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    pub config: BTreeMap<String, String>,
    /// `trusted` or `untrusted`.
    pub auth: String,
    pub environment: ServerEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvironment {
    pub server_name: String,
    pub server_clustered: bool,
    pub server_version: String,
    pub addresses: Vec<String>,
    pub certificate: String,
    pub certificate_fingerprint: String,
}

/// `POST /1.0/images` body: record that this member holds an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesPost {
    pub fingerprint: String,
}

/// An image and the members holding it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageView {
    pub fingerprint: String,
    pub members: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_put_defaults_missing_fields() {
        let put: ClusterPut =
            serde_json::from_str(r#"{"server_name":"buzz","enabled":true}"#).unwrap();
        assert_eq!(put.server_name, "buzz");
        assert!(put.enabled);
        assert!(put.cluster_address.is_empty());
        assert!(put.cluster_certificate.is_empty());
    }

    #[test]
    fn certificates_post_uses_type_key() {
        let post: CertificatesPost = serde_json::from_str(
            r#"{"name":"flock.cluster.node2","type":"client","certificate":"","password":"sekret"}"#,
        )
        .unwrap();
        assert_eq!(post.kind, CertificateType::Client);
        assert_eq!(post.password, "sekret");
    }

    #[test]
    fn member_status_serializes_capitalized() {
        assert_eq!(
            serde_json::to_value(MemberStatus::Online).unwrap(),
            "Online"
        );
    }
}
