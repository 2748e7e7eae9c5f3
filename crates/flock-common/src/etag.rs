//! Content-hash ETags for optimistic concurrency on config writes.
//!
//! The ETag of a representation is the lowercase hex SHA-256 of its JSON
//! encoding. A conditional write carries the ETag the caller last saw in
//! `If-Match`; the server recomputes the hash of the current value and
//! rejects the write when they differ.

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum EtagError {
    #[error("ETag doesn't match: {current} vs {expected}")]
    Mismatch { current: String, expected: String },

    #[error("failed to encode representation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hash the JSON encoding of `value`.
pub fn etag_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, EtagError> {
    let json = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&json);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Validate an `If-Match` value against the current representation.
///
/// A missing or empty header always passes. Surrounding quotes are
/// stripped so both `abc` and `"abc"` are accepted.
pub fn etag_check<T: Serialize + ?Sized>(
    if_match: Option<&str>,
    current: &T,
) -> Result<(), EtagError> {
    let expected = match if_match.map(|s| s.trim().trim_matches('"')) {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(()),
    };

    let hash = etag_hash(current)?;
    if hash != expected {
        return Err(EtagError::Mismatch {
            current: hash,
            expected: expected.to_string(),
        });
    }
    Ok(())
}
