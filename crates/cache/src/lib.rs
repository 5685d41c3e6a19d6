#![warn(clippy::unwrap_used)]

pub mod backend;
pub mod chain;
pub mod client;
pub mod disk;
pub mod local;

pub use backend::{CacheBackend, CacheError, MAX_TTL};
pub use chain::ContentCache;
pub use client::RedisCache;
pub use disk::DiskCache;
pub use local::LocalCache;
