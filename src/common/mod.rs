//! Common types shared across spillcache.
//!
//! - Configuration ([`CacheConfig`](config::CacheConfig) and constants)
//! - Error types

pub mod config;
pub mod error;

pub use error::{Error, Result};
