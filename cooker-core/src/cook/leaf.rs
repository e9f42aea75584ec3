//! Contracts for the per-item transform layer.
//!
//! The cooker never interprets content. It loads, polls, saves and hashes
//! items through [`ContentProvider`] and commits artifacts through
//! [`ArtifactSink`]; everything those calls do is opaque to the scheduler.

use std::{any::Any, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ContentHash, ItemId, Platform};

/// Failure reported by a leaf operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafError {
    /// I/O hiccup, temporary lock or similar. Eligible for one retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The operation did not finish in its time budget. Eligible for one retry.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Missing or corrupt input, validation failure. Never retried.
    #[error("content error: {0}")]
    Content(String),

    /// The item cannot be cooked for the platform at all.
    #[error("not cookable: {0}")]
    NotCookable(String),
}

/// Coarse classification driving retry and result policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Content,
    Invalid,
}

impl LeafError {
    pub fn class(&self) -> FailureClass {
        match self {
            LeafError::Transient(_) | LeafError::Timeout(_) => FailureClass::Transient,
            LeafError::Content(_) => FailureClass::Content,
            LeafError::NotCookable(_) => FailureClass::Invalid,
        }
    }
}

/// Result of polling asynchronous leaf work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
}

/// In-memory content of one loaded item.
///
/// The handle owns whatever the provider loaded; dropping it is the release.
/// The cooker keeps exactly one handle per loaded item and drops it on every
/// path out of the load/save states.
pub struct ContentHandle {
    inner: Box<dyn Any + Send>,
}

impl ContentHandle {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle").finish_non_exhaustive()
    }
}

/// Everything a successful save produced for one platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutput {
    /// Serialized artifact handed to [`ArtifactSink::persist`].
    pub artifact: Vec<u8>,
    /// Hard runtime references found while saving.
    pub imports: Vec<ItemId>,
    /// Soft runtime references found while saving.
    pub soft_refs: Vec<ItemId>,
    /// Content that influenced the output without being referenced at runtime.
    pub build_deps: Vec<ItemId>,
    /// Session-scoped sub-items produced by this item.
    pub generated: Vec<ItemId>,
}

/// Metadata stored alongside a persisted artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub input_hash: Option<ContentHash>,
    pub byte_len: usize,
}

/// The transform layer consumed by the cooker.
pub trait ContentProvider: Send + Sync {
    /// Loads an item into memory.
    fn load(&self, id: &ItemId) -> Result<ContentHandle, LeafError>;

    /// Preload readiness: whatever the item needs before `load` can run.
    fn poll_preload(&self, _id: &ItemId) -> Readiness {
        Readiness::Ready
    }

    /// Asynchronous per-platform work that must finish before `save`.
    fn poll_ready(
        &self,
        _id: &ItemId,
        _platform: &Platform,
        _content: &ContentHandle,
    ) -> Result<Readiness, LeafError> {
        Ok(Readiness::Ready)
    }

    /// Serializes the loaded content for one platform.
    fn save(
        &self,
        id: &ItemId,
        platform: &Platform,
        content: &ContentHandle,
    ) -> Result<SaveOutput, LeafError>;

    /// Whether the content may be dropped right now. The garbage collector
    /// defers while any loaded item reports `false`.
    fn can_release(&self, _id: &ItemId, _content: &ContentHandle) -> bool {
        true
    }

    /// Statically known dependencies, used to cluster requests.
    fn dependencies(&self, id: &ItemId) -> Vec<ItemId>;

    /// Hash of the item's own current content.
    fn hash(&self, id: &ItemId) -> Result<ContentHash, LeafError>;
}

/// Commits successful save output.
pub trait ArtifactSink: Send + Sync {
    fn persist(
        &self,
        id: &ItemId,
        platform: &Platform,
        artifact: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<(), LeafError>;
}
