//! On-disk cache infra.
//!
//! A typed facade around `cacache` for integrity-checked build cache entries.

/// [`BuildCacheStore`](crate::cook::BuildCacheStore) on disk
pub mod disk_store;

pub use disk_store::*;
