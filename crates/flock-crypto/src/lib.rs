//! Flock crypto: daemon identity, certificate pinning and trust password
//! hashing.

pub mod identity;
pub mod password;
pub mod pinning;
