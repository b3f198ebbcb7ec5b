//! Gateway composition root.
//!
//! [`Heimdall::builder`] assembles adapters, rate limits, retry policy,
//! cache and health settings into a [`Gateway`] handle. There is no global
//! instance; callers construct one and pass it around.

mod builder;
mod embedded;

pub use builder::{Heimdall, HeimdallBuilder};
pub use embedded::Gateway;
