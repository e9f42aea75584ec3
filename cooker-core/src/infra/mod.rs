//! Storage backends behind the scheduler's traits.

/// `cacache`-backed build cache store
pub mod cache;
