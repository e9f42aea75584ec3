//! Identifiers and content hashes shared across the crate.

/// SHA-256 content hashes
pub mod hash;
/// Item, platform and worker identifiers
pub mod ids;

pub use hash::{ContentHash, InputHasher};
pub use ids::{ItemId, Platform, WorkerId};
