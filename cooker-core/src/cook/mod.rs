//! The cook scheduler: work items, their state machine, the queues between
//! pipeline stages and the policies (cache, retry, GC) applied along the way.

/// Incremental build cache
pub mod cache;
/// Leaf-first ordering of request batches
pub mod cluster;
/// Tunables for every stage
pub mod config;
/// The scheduler and its public API
pub mod cooker;
/// Completion and state-change notifications
pub mod events;
/// When to collect garbage
pub mod gc;
/// Work items, instigators and per-platform results
pub mod item;
/// Traits the cooker consumes from the content layer
pub mod leaf;
/// Periodic tasks run between pumps
pub mod pollable;
/// Urgency-banded queues
pub mod queue;
pub(crate) mod session;
/// Item states and legal transitions
pub mod state;
/// Arena of work items keyed by id
pub mod table;

mod discovery;
mod load;
mod save;

pub use cache::{BuildCache, BuildCacheEntry, BuildCacheStore, CacheLookup, MemoryCacheStore, MissReason};
pub use config::CookerConfig;
pub use cooker::{CookAction, CookSummary, Cooker, CookerCommand, CookerHandle};
pub use events::{CookEvent, CookEventBus};
pub use gc::{CollectionRequest, Collector, GcTrigger, MemoryPressure, MemoryProbe, MemorySample};
pub use item::{DependencyKind, DiscoveredDependency, Instigator, PlatformResult, Reachability, Urgency, WorkItem};
pub use leaf::{ArtifactMetadata, ArtifactSink, ContentHandle, ContentProvider, LeafError, Readiness, SaveOutput};
pub use state::{ItemState, LoadSubState, SaveSubState, StateChangeReason};
