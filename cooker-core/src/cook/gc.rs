//! Garbage collection scheduling.
//!
//! The controller only decides *when* to collect and how large a soft pass
//! should be; the scheduler performs the pass at a point where no item is
//! between two leaf calls.

use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::GcConfig;

/// Memory pressure as seen by a [`MemoryProbe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Elevated,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySample {
    pub available_physical_mb: u64,
    pub available_virtual_mb: u64,
    pub pressure: MemoryPressure,
}

impl MemorySample {
    pub fn unconstrained() -> Self {
        Self {
            available_physical_mb: u64::MAX,
            available_virtual_mb: u64::MAX,
            pressure: MemoryPressure::Normal,
        }
    }
}

/// Source of memory readings.
pub trait MemoryProbe: Send {
    fn sample(&mut self) -> MemorySample;
}

/// Probe that never reports pressure.
#[derive(Debug, Default)]
pub struct NoMemoryPressure;

impl MemoryProbe for NoMemoryPressure {
    fn sample(&mut self) -> MemorySample {
        MemorySample::unconstrained()
    }
}

/// Probe backed by the operating system's memory counters.
#[cfg(feature = "system-memory")]
pub struct SystemMemoryProbe {
    system: sysinfo::System,
}

#[cfg(feature = "system-memory")]
impl fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemoryProbe").finish_non_exhaustive()
    }
}

#[cfg(feature = "system-memory")]
impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "system-memory")]
impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

#[cfg(feature = "system-memory")]
impl MemoryProbe for SystemMemoryProbe {
    fn sample(&mut self) -> MemorySample {
        const MB: u64 = 1024 * 1024;
        self.system.refresh_memory();
        let total = self.system.total_memory().max(1);
        let available = self.system.available_memory();
        let used_ratio = 1.0 - (available as f64 / total as f64);
        let pressure = if used_ratio >= 0.95 {
            MemoryPressure::Critical
        } else if used_ratio >= 0.85 {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Normal
        };
        MemorySample {
            available_physical_mb: available / MB,
            available_virtual_mb: (available + self.system.free_swap()) / MB,
            pressure,
        }
    }
}

/// The probe used when the embedder does not supply one.
pub fn default_probe() -> Box<dyn MemoryProbe> {
    #[cfg(feature = "system-memory")]
    {
        Box::new(SystemMemoryProbe::new())
    }
    #[cfg(not(feature = "system-memory"))]
    {
        Box::new(NoMemoryPressure)
    }
}

/// What caused a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcTrigger {
    ItemCount,
    MemoryPressure,
    Idle,
    Soft,
}

/// A collection the scheduler should run now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionRequest {
    pub trigger: GcTrigger,
    /// Full passes evict every evictable item; soft passes evict
    /// `numerator / denominator` of them.
    pub full: bool,
    pub numerator: u32,
    pub denominator: u32,
}

impl CollectionRequest {
    fn full(trigger: GcTrigger) -> Self {
        Self {
            trigger,
            full: true,
            numerator: 1,
            denominator: 1,
        }
    }

    /// How many of `candidates` evictable items this pass releases.
    pub fn eviction_quota(&self, candidates: usize) -> usize {
        if self.full {
            return candidates;
        }
        let denominator = self.denominator.max(1) as usize;
        (candidates * self.numerator as usize).div_ceil(denominator)
    }

    /// Only memory pressure and soft passes evict loaded items.
    pub fn evicts(&self) -> bool {
        matches!(self.trigger, GcTrigger::MemoryPressure | GcTrigger::Soft)
    }
}

/// Outcome of a collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub evicted: usize,
    pub released: usize,
}

/// Hook run during a collection, after evictions. Lets the embedder drop
/// its own caches.
pub trait Collector: Send {
    fn collect(&mut self, request: &CollectionRequest) -> usize;
}

#[derive(Debug, Default)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn collect(&mut self, _request: &CollectionRequest) -> usize {
        0
    }
}

/// Evaluates every collection trigger on each GC check.
pub struct GcController {
    config: GcConfig,
    probe: Box<dyn MemoryProbe>,
    completed_since_collect: u32,
    last_progress: Instant,
    idle_collected: bool,
    last_soft: Instant,
    soft_numerator: u32,
    collections: u64,
    soft_time: Duration,
    soft_window_start: Instant,
}

impl fmt::Debug for GcController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcController")
            .field("completed_since_collect", &self.completed_since_collect)
            .field("soft_numerator", &self.soft_numerator)
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

impl GcController {
    pub fn new(config: GcConfig, probe: Box<dyn MemoryProbe>, now: Instant) -> Self {
        let soft_numerator = config
            .soft_start_numerator
            .clamp(1, config.soft_denominator.max(1));
        Self {
            config,
            probe,
            completed_since_collect: 0,
            last_progress: now,
            idle_collected: false,
            last_soft: now,
            soft_numerator,
            collections: 0,
            soft_time: Duration::ZERO,
            soft_window_start: now,
        }
    }

    pub fn set_probe(&mut self, probe: Box<dyn MemoryProbe>) {
        self.probe = probe;
    }

    /// An item finished all of its platforms.
    pub fn note_item_completed(&mut self) {
        self.completed_since_collect = self.completed_since_collect.saturating_add(1);
    }

    pub fn note_progress(&mut self, now: Instant) {
        self.last_progress = now;
        self.idle_collected = false;
    }

    /// True once the item-count trigger is armed. Pumps stop early on this
    /// so the collection lands between two completions.
    pub fn item_threshold_reached(&self) -> bool {
        self.config.items_per_collection > 0
            && self.completed_since_collect >= self.config.items_per_collection
    }

    /// Items that may still finish before the item-count trigger arms.
    pub fn items_until_collection(&self) -> Option<u32> {
        (self.config.items_per_collection > 0).then(|| {
            self.config
                .items_per_collection
                .saturating_sub(self.completed_since_collect)
        })
    }

    pub fn soft_numerator(&self) -> u32 {
        self.soft_numerator
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Evaluates every trigger. The first that fires wins.
    pub fn evaluate(&mut self, now: Instant) -> Option<CollectionRequest> {
        if self.item_threshold_reached() {
            return Some(CollectionRequest::full(GcTrigger::ItemCount));
        }

        let sample = self.probe.sample();
        let physical_low = self.config.min_free_physical_mb > 0
            && sample.available_physical_mb < self.config.min_free_physical_mb;
        let virtual_low = self.config.min_free_virtual_mb > 0
            && sample.available_virtual_mb < self.config.min_free_virtual_mb;
        let pressured = self
            .config
            .trigger_at_pressure
            .is_some_and(|level| sample.pressure >= level);
        if physical_low || virtual_low || pressured {
            debug!(target: "cook::gc", ?sample, "memory pressure");
            return Some(CollectionRequest::full(GcTrigger::MemoryPressure));
        }

        if let Some(after) = self.config.idle_collect_after()
            && !self.idle_collected
            && now.saturating_duration_since(self.last_progress) >= after
        {
            self.idle_collected = true;
            return Some(CollectionRequest::full(GcTrigger::Idle));
        }

        if self.config.soft_enabled
            && now.saturating_duration_since(self.last_soft) >= self.config.soft_period()
        {
            self.last_soft = now;
            return Some(CollectionRequest {
                trigger: GcTrigger::Soft,
                full: false,
                numerator: self.soft_numerator,
                denominator: self.config.soft_denominator.max(1),
            });
        }
        None
    }

    /// Records a finished pass and adapts the soft share toward the time budget.
    pub fn finish(
        &mut self,
        request: &CollectionRequest,
        report: &CollectionReport,
        elapsed: Duration,
        now: Instant,
    ) {
        self.collections += 1;
        if request.full {
            self.completed_since_collect = 0;
        } else {
            self.soft_time += elapsed;
            let window = now
                .saturating_duration_since(self.soft_window_start)
                .max(self.config.soft_period())
                .max(Duration::from_millis(1));
            let spent = self.soft_time.as_secs_f32() / window.as_secs_f32();
            let denominator = self.config.soft_denominator.max(1);
            if spent > self.config.soft_time_fraction_budget {
                self.soft_numerator = self.soft_numerator.saturating_sub(1).max(1);
            } else if report.evicted + report.released > 0 {
                self.soft_numerator = (self.soft_numerator + 1).min(denominator);
            }
        }
        info!(
            target: "cook::gc",
            trigger = ?request.trigger,
            full = request.full,
            evicted = report.evicted,
            released = report.released,
            elapsed_ms = elapsed.as_millis() as u64,
            "collection finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(MemorySample);

    impl MemoryProbe for Scripted {
        fn sample(&mut self) -> MemorySample {
            self.0
        }
    }

    fn quiet() -> GcConfig {
        GcConfig {
            items_per_collection: 0,
            min_free_physical_mb: 0,
            idle_collect_after_ms: 0,
            trigger_at_pressure: None,
            ..GcConfig::default()
        }
    }

    #[test]
    fn item_count_trigger_resets_after_full_pass() {
        let now = Instant::now();
        let config = GcConfig {
            items_per_collection: 2,
            ..quiet()
        };
        let mut gc = GcController::new(config, Box::new(NoMemoryPressure), now);
        gc.note_item_completed();
        assert!(gc.evaluate(now).is_none());
        gc.note_item_completed();
        let request = gc.evaluate(now).unwrap();
        assert_eq!(request.trigger, GcTrigger::ItemCount);
        gc.finish(&request, &CollectionReport::default(), Duration::ZERO, now);
        gc.note_item_completed();
        assert!(gc.evaluate(now).is_none());
        assert_eq!(gc.collections(), 1);
    }

    #[test]
    fn reported_pressure_fires_at_the_configured_level() {
        let now = Instant::now();
        let elevated = MemorySample {
            pressure: MemoryPressure::Elevated,
            ..MemorySample::unconstrained()
        };
        let config = GcConfig {
            trigger_at_pressure: Some(MemoryPressure::Elevated),
            ..quiet()
        };
        let mut gc = GcController::new(config, Box::new(Scripted(elevated)), now);
        let request = gc.evaluate(now).unwrap();
        assert_eq!(request.trigger, GcTrigger::MemoryPressure);
        assert!(request.evicts());

        let config = GcConfig {
            trigger_at_pressure: Some(MemoryPressure::Critical),
            ..quiet()
        };
        let mut gc = GcController::new(config, Box::new(Scripted(elevated)), now);
        assert!(gc.evaluate(now).is_none());
    }

    #[test]
    fn low_physical_memory_fires() {
        let now = Instant::now();
        let config = GcConfig {
            min_free_physical_mb: 512,
            ..quiet()
        };
        let probe = Scripted(MemorySample {
            available_physical_mb: 100,
            available_virtual_mb: u64::MAX,
            pressure: MemoryPressure::Normal,
        });
        let mut gc = GcController::new(config, Box::new(probe), now);
        let request = gc.evaluate(now).unwrap();
        assert_eq!(request.trigger, GcTrigger::MemoryPressure);
        assert!(request.evicts());
    }

    #[test]
    fn idle_fires_once_until_progress() {
        let start = Instant::now();
        let config = GcConfig {
            idle_collect_after_ms: 10,
            ..quiet()
        };
        let mut gc = GcController::new(config, Box::new(NoMemoryPressure), start);
        let later = start + Duration::from_millis(20);
        assert_eq!(gc.evaluate(later).map(|r| r.trigger), Some(GcTrigger::Idle));
        assert!(gc.evaluate(later).is_none());
        gc.note_progress(later);
        let much_later = later + Duration::from_millis(20);
        assert_eq!(gc.evaluate(much_later).map(|r| r.trigger), Some(GcTrigger::Idle));
    }

    #[test]
    fn soft_share_shrinks_when_over_budget() {
        let start = Instant::now();
        let config = GcConfig {
            soft_enabled: true,
            soft_period_ms: 100,
            ..quiet()
        };
        let mut gc = GcController::new(config, Box::new(NoMemoryPressure), start);
        let due = start + Duration::from_millis(100);
        let request = gc.evaluate(due).unwrap();
        assert!(!request.full);
        assert_eq!(request.eviction_quota(10), 5);
        gc.finish(&request, &CollectionReport::default(), Duration::from_millis(50), due);
        assert_eq!(gc.soft_numerator(), 4);
        assert!(gc.evaluate(due).is_none());
    }
}
