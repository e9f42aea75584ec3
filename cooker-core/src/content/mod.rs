//! Leaf layer implementations shipped with the cooker.

/// Plain-file provider and sink
pub mod fs;

pub use fs::{FsArtifactSink, FsContentProvider, SourceItem};
