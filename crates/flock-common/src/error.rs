use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by the REST surface, the internal member API and the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    Conflict,
    Unauthorized,
    IoError,
    Internal,
    // Cluster membership
    AlreadyClustered,
    PreconditionFailed,
    ResourceConflict,
    EtagMismatch,
    NetworkError,
    // Operations
    NotCancellable,
    Cancelled,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidPayload => 400,
            Self::Unauthorized => 403,
            Self::NotFound => 404,
            Self::Conflict
            | Self::AlreadyClustered
            | Self::PreconditionFailed
            | Self::ResourceConflict
            | Self::NotCancellable
            | Self::Cancelled => 409,
            Self::EtagMismatch => 412,
            Self::IoError | Self::Internal => 500,
            Self::NetworkError => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::AlreadyClustered).unwrap(),
            "already_clustered"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::EtagMismatch).unwrap(),
            "etag_mismatch"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NotFound).unwrap(),
            "not_found"
        );
    }

    /// Every variant is listed so a new code forces this table to be revisited.
    #[test]
    fn all_error_code_variants_map_to_expected_http_status() {
        let cases: Vec<(ErrorCode, u16)> = vec![
            (ErrorCode::InvalidPayload, 400),
            (ErrorCode::Unauthorized, 403),
            (ErrorCode::NotFound, 404),
            (ErrorCode::Conflict, 409),
            (ErrorCode::AlreadyClustered, 409),
            (ErrorCode::PreconditionFailed, 409),
            (ErrorCode::ResourceConflict, 409),
            (ErrorCode::NotCancellable, 409),
            (ErrorCode::Cancelled, 409),
            (ErrorCode::EtagMismatch, 412),
            (ErrorCode::IoError, 500),
            (ErrorCode::Internal, 500),
            (ErrorCode::NetworkError, 503),
        ];
        for (code, expected_status) in &cases {
            assert_eq!(
                code.http_status(),
                *expected_status,
                "{code:?} should map to HTTP {expected_status}"
            );
        }
    }

    #[test]
    fn error_code_round_trips_through_json() {
        let json = serde_json::to_string(&ErrorCode::ResourceConflict).unwrap();
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::ResourceConflict);
    }
}
