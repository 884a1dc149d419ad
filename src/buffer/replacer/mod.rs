//! Eviction policy.
//!
//! - [`LrfuEvictionQueue`] - combined recency and frequency ranking
//! - [`CacheKey`] - the total order entries are ranked by

mod cache_key;
mod lrfu;

pub use cache_key::CacheKey;
pub use lrfu::{LrfuEvictionQueue, FREQUENCY_INCREMENT};
