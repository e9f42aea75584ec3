//! # Cooker Core
//!
//! Build orchestration for content pipelines: turns source items into
//! platform-specific artifacts, cooking each (item, platform) pair at most
//! once per session.
//!
//! ## Overview
//!
//! - **Work items**: every item moves through an explicit state machine
//!   (`Idle → Request → Load → SaveActive → Idle`) with one result per
//!   requested platform.
//! - **Scheduler**: a single-threaded, poll-based loop ([`cook::Cooker`])
//!   that pumps bounded queues between stages, time-sliced.
//! - **Dependency discovery**: edges found while saving are requested only
//!   once the discovering platform completes.
//! - **Incremental cache**: per-platform entries keyed on the item's hash and
//!   the hashes of its transitive build dependencies.
//! - **GC control**: collections at safe points between items, triggered by
//!   item count, memory pressure, idleness or a soft budget.
//! - **Distribution**: a director hands batches to workers over framed
//!   messages ([`distrib`]) and reclaims work from dead or overloaded
//!   workers.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cooker_core::{
//!     content::{FsArtifactSink, FsContentProvider},
//!     cook::{CookerConfig, Cooker, Instigator, MemoryCacheStore, Urgency},
//!     types::Platform,
//! };
//!
//! fn cook_one() -> cooker_core::error::Result<()> {
//!     let mut cooker = Cooker::new(
//!         CookerConfig::default(),
//!         Arc::new(FsContentProvider::new("content")),
//!         Arc::new(FsArtifactSink::new("cooked")),
//!         Box::new(MemoryCacheStore::new()),
//!     );
//!     cooker.request_item("maps/level.txt", &[Platform::new("linux")], Urgency::Normal, Instigator::Root)?;
//!     let summary = cooker.run()?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Filesystem content provider and artifact sink
pub mod content;
/// Scheduler, work items and the policies applied to them
pub mod cook;
/// Director/worker protocol and transports
pub mod distrib;
/// Session-level error type
pub mod error;
/// Storage backends
pub mod infra;
/// Identifiers and content hashes
pub mod types;

pub use error::{CookError, Result};
