//! Trust password hashing.
//!
//! `core.trust_password` is never stored in clear. It is stretched with
//! Argon2id under a random salt and kept as `<salt hex>$<hash hex>`.

use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::pinning::{hex_decode, hex_encode};

/// Salt length for Argon2id.
const SALT_LEN: usize = 16;

/// Derived hash length.
const HASH_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Hash a trust password for storage.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let hash = derive(password, &salt)?;
    Ok(format!("{}${}", hex_encode(&salt), hex_encode(&hash)))
}

/// Check `password` against a value produced by [`hash_password`].
///
/// Malformed stored values never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let (Some(salt), Some(expected)) = (hex_decode(salt_hex), hex_decode(hash_hex)) else {
        return false;
    };
    match derive(password, &salt) {
        Ok(actual) => actual.as_slice().ct_eq(expected.as_slice()).into(),
        Err(e) => {
            tracing::warn!(error = %e, "Trust password verification failed");
            false
        }
    }
}

fn derive(password: &str, salt: &[u8]) -> Result<[u8; HASH_LEN], PasswordError> {
    let mut out = [0u8; HASH_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_verifies() {
        let stored = hash_password("sekret").unwrap();
        assert!(verify_password("sekret", &stored));
    }

    #[test]
    fn wrong_password_fails() {
        let stored = hash_password("sekret").unwrap();
        assert!(!verify_password("not-sekret", &stored));
        assert!(!verify_password("", &stored));
    }

    #[test]
    fn same_password_hashes_differently() {
        let a = hash_password("sekret").unwrap();
        let b = hash_password("sekret").unwrap();
        assert_ne!(a, b, "random salt should make hashes distinct");
        assert!(!a.contains("sekret"));
    }

    #[test]
    fn malformed_stored_value_never_verifies() {
        assert!(!verify_password("sekret", "sekret"));
        assert!(!verify_password("sekret", "zz$zz"));
        assert!(!verify_password("sekret", ""));
    }
}
