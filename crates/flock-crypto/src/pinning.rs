//! Certificate fingerprinting for trust pinning.
//!
//! Every daemon is identified by the SHA-256 fingerprint of its TLS
//! certificate. Peers pin that fingerprint when calling each other and
//! the trust store keys registered clients by it.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compute a SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint as a lowercase hex string.
pub fn fingerprint_sha256(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hex_encode(&hash)
}

/// Compare two fingerprint strings in constant time.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    a_bytes.ct_eq(b_bytes).into()
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
