//! Flock common: types and helpers shared by every flock crate.

pub mod api;
pub mod error;
pub mod etag;
pub mod http;
pub mod id;
pub mod paths;
pub mod persist;
