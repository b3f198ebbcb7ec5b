//! Response caching.
//!
//! - [`response::ResponseCache`] memoizes generation responses for a fixed
//!   TTL in an in-process moka tier, optionally fronted by a shared
//!   [`CacheClient`].
//! - [`remote`] defines the [`CacheClient`] seam and, with the `redis`
//!   feature, a Redis implementation.

pub mod remote;
pub mod response;

#[cfg(feature = "redis")]
pub use remote::RedisCacheClient;
pub use remote::CacheClient;
pub use response::{CacheConfig, KEY_PREFIX, ResponseCache, cache_key};
