//! REST path conventions and the error body shared by every endpoint.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// API version prefix.
pub const API_PREFIX: &str = "/1.0";

/// Collection path for cluster members.
pub const MEMBERS_PATH: &str = "/1.0/cluster/members";

/// Collection path for operations.
pub const OPERATIONS_PATH: &str = "/1.0/operations";

/// Standard error body for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

pub fn error_body(code: ErrorCode, message: impl Into<String>) -> ErrorBody {
    ErrorBody {
        error: code,
        message: message.into(),
    }
}

/// Canonical URL of a cluster member: `/1.0/cluster/members/<name>`.
pub fn member_url(server_name: &str) -> String {
    format!("{MEMBERS_PATH}/{server_name}")
}

/// Canonical URL of an operation: `/1.0/operations/<id>`.
pub fn operation_url(id: &str) -> String {
    format!("{OPERATIONS_PATH}/{id}")
}
