//! Cluster domain error types.

use flock_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not authorized")]
    Unauthorized,

    #[error("server is already clustered")]
    AlreadyClustered,

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Conflict(String),

    /// Leave blocked by resources only the leaving member holds.
    #[error("node still has the following images: {}", .0.join(", "))]
    ResourceConflict(Vec<String>),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    EtagMismatch(String),

    #[error("{0}")]
    Network(String),

    /// A peer answered an internal request with an error.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    /// The join target rejected or failed the join request.
    #[error("failed to request to add node: {reason}")]
    AddNode { code: ErrorCode, reason: String },

    /// A finished operation's stored failure, replayed to a waiter.
    #[error("{message}")]
    OperationFailed { code: ErrorCode, message: String },

    #[error("operation cannot be cancelled")]
    NotCancellable,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    InvalidPayload(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ClusterError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

impl From<flock_crypto::identity::IdentityError> for ClusterError {
    fn from(e: flock_crypto::identity::IdentityError) -> Self {
        match e {
            flock_crypto::identity::IdentityError::InvalidCertificate(msg) => {
                Self::InvalidPayload(format!("invalid certificate: {msg}"))
            }
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<flock_crypto::password::PasswordError> for ClusterError {
    fn from(e: flock_crypto::password::PasswordError) -> Self {
        Self::Crypto(e.to_string())
    }
}

impl From<flock_common::etag::EtagError> for ClusterError {
    fn from(e: flock_common::etag::EtagError) -> Self {
        match e {
            flock_common::etag::EtagError::Mismatch { .. } => Self::EtagMismatch(e.to_string()),
            flock_common::etag::EtagError::Encode(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<&ClusterError> for ErrorCode {
    fn from(e: &ClusterError) -> Self {
        match e {
            ClusterError::Unauthorized => ErrorCode::Unauthorized,
            ClusterError::AlreadyClustered => ErrorCode::AlreadyClustered,
            ClusterError::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            ClusterError::Conflict(_) => ErrorCode::Conflict,
            ClusterError::ResourceConflict(_) => ErrorCode::ResourceConflict,
            ClusterError::NotFound(_) => ErrorCode::NotFound,
            ClusterError::EtagMismatch(_) => ErrorCode::EtagMismatch,
            ClusterError::Network(_) => ErrorCode::NetworkError,
            ClusterError::Remote { code, .. } => *code,
            ClusterError::AddNode { code, .. } => *code,
            ClusterError::OperationFailed { code, .. } => *code,
            ClusterError::NotCancellable => ErrorCode::NotCancellable,
            ClusterError::Cancelled => ErrorCode::Cancelled,
            ClusterError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            ClusterError::Io(_) => ErrorCode::IoError,
            ClusterError::Crypto(_) | ClusterError::Internal(_) => ErrorCode::Internal,
        }
    }
}
