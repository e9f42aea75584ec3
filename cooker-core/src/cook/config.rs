use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gc::MemoryPressure;

/// Global knobs that tune cooker behaviour.
///
/// All fields carry defaults so a config file only needs to name the values
/// it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CookerConfig {
    /// Queue watermarks, batch sizes and time slicing.
    pub queue: QueueConfig,
    /// Retry policy for transient leaf failures.
    pub retry: RetryConfig,
    /// Garbage collection triggers.
    pub gc: GcConfig,
    /// Incremental build cache settings.
    pub cache: CacheConfig,
    /// Director/worker distribution settings.
    pub distribution: DistributionConfig,
    /// Session-wide behaviour.
    pub session: SessionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum external requests absorbed per tick.
    pub max_intake_batch: usize,
    /// Maximum requests clustered and classified per tick.
    pub max_request_batch: usize,
    /// Desired population of the load stage. Requests are only promoted while
    /// the load queue is below this.
    pub desired_load_population: usize,
    /// Desired population of the save stage. Loads are only pumped while the
    /// save queue is below this; above it saves are drained first.
    pub desired_save_population: usize,
    /// Time slice handed to a single pump call.
    pub pump_slice_ms: u64,
    /// Bounded sleep when only asynchronous leaf work is outstanding.
    pub idle_sleep_ms: u64,
}

impl QueueConfig {
    pub fn pump_slice(&self) -> Duration {
        Duration::from_millis(self.pump_slice_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_intake_batch: 256,
            max_request_batch: 64,
            desired_load_population: 16,
            desired_save_population: 32,
            pump_slice_ms: 50,
            idle_sleep_ms: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Automatic retries granted to a transient failure of one (item, platform).
    /// A further transient failure is terminal.
    pub max_transient_retries: u16,
    /// How long a save may wait on leaf readiness before it counts as a timeout.
    pub save_timeout_ms: u64,
}

impl RetryConfig {
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 1,
            save_timeout_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Collect after this many items finished since the last collection. 0 disables.
    pub items_per_collection: u32,
    /// Collect when available physical memory drops below this. 0 disables.
    pub min_free_physical_mb: u64,
    /// Collect when available virtual memory drops below this. 0 disables.
    pub min_free_virtual_mb: u64,
    /// Collect when the probe reports at least this pressure level. Unset disables.
    pub trigger_at_pressure: Option<MemoryPressure>,
    /// Collect after the scheduler made no progress for this long. 0 disables.
    pub idle_collect_after_ms: u64,
    /// Enables periodic partial collections.
    pub soft_enabled: bool,
    /// Minimum spacing between soft collections.
    pub soft_period_ms: u64,
    /// Initial share of evictable items a soft pass releases, over the denominator.
    pub soft_start_numerator: u32,
    pub soft_denominator: u32,
    /// Target fraction of wall time spent in soft collections.
    pub soft_time_fraction_budget: f32,
    /// How often memory and counters are checked.
    pub check_interval_ms: u64,
}

impl GcConfig {
    pub fn idle_collect_after(&self) -> Option<Duration> {
        (self.idle_collect_after_ms > 0).then(|| Duration::from_millis(self.idle_collect_after_ms))
    }

    pub fn soft_period(&self) -> Duration {
        Duration::from_millis(self.soft_period_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            items_per_collection: 500,
            min_free_physical_mb: 1_024,
            min_free_virtual_mb: 0,
            trigger_at_pressure: Some(MemoryPressure::Elevated),
            idle_collect_after_ms: 20_000,
            soft_enabled: false,
            soft_period_ms: 30_000,
            soft_start_numerator: 5,
            soft_denominator: 10,
            soft_time_fraction_budget: 0.05,
            check_interval_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Skip items whose recorded inputs still match.
    pub incremental: bool,
    /// Structural version of the cache. Bumping it invalidates every entry.
    pub version: Uuid,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            incremental: true,
            version: Uuid::from_u128(0x5f2c_1b0e_7a44_4d51_9a3e_c0c4_0b1e_0001),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Number of worker processes. 0 cooks in a single process.
    pub workers: u32,
    /// Maximum items shipped in one assignment message.
    pub max_assignment_batch: usize,
    /// Desired number of assigned items per worker.
    pub worker_queue_depth: usize,
    /// Heartbeat cadence.
    pub heartbeat_interval_ms: u64,
    /// A worker that misses this many consecutive heartbeats is presumed dead.
    pub missed_heartbeats_before_dead: u32,
    /// How long a spawned worker may take to send its connect message.
    pub connect_timeout_ms: u64,
    /// How long to wait for an abort acknowledgement before giving up on it.
    pub abort_ack_timeout_ms: u64,
    /// How long to wait for a worker to flush and acknowledge shutdown.
    pub shutdown_timeout_ms: u64,
    /// Malformed messages tolerated from one peer before it is treated as dead.
    pub max_protocol_errors: u32,
    /// Rebalance when one worker holds this many more items than an idle one.
    pub rebalance_threshold: usize,
    /// Offload a local save stalled on readiness for this long to an idle worker.
    /// 0 disables.
    pub offload_stalled_save_after_ms: u64,
}

impl DistributionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn abort_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_ack_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn offload_stalled_save_after(&self) -> Option<Duration> {
        (self.offload_stalled_save_after_ms > 0)
            .then(|| Duration::from_millis(self.offload_stalled_save_after_ms))
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_assignment_batch: 16,
            worker_queue_depth: 32,
            heartbeat_interval_ms: 1_000,
            missed_heartbeats_before_dead: 3,
            connect_timeout_ms: 20 * 60 * 1_000,
            abort_ack_timeout_ms: 30_000,
            shutdown_timeout_ms: 10 * 60 * 1_000,
            max_protocol_errors: 8,
            rebalance_threshold: 8,
            offload_stalled_save_after_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Do not cook soft references discovered during save.
    pub skip_soft_references: bool,
    /// Capacity of the completion broadcast channel.
    pub event_channel_capacity: usize,
    /// Cadence of the progress summary log line.
    pub summary_interval_ms: u64,
}

impl SessionConfig {
    pub fn summary_interval(&self) -> Duration {
        Duration::from_millis(self.summary_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            skip_soft_references: false,
            event_channel_capacity: 4_096,
            summary_interval_ms: 10_000,
        }
    }
}
