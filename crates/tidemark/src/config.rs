//! Tunables for marking and allocation pacing.

use std::time::Duration;

use crate::error::ConfigError;

/// Default minimum chunk width, in array elements, for chunked array scanning.
pub const DEFAULT_ARRAY_STRIDE: usize = 512;
/// Default capacity of each worker's local task store.
pub const DEFAULT_LOCAL_QUEUE_CAPACITY: usize = 1 << 13;
/// Default live-data flush threshold, matching a 16-bit saturating counter.
pub const DEFAULT_LIVE_DATA_FLUSH_THRESHOLD: u32 = u16::MAX as u32;
/// Default number of tasks a worker processes between progress reports.
pub const DEFAULT_PROGRESS_REPORT_STRIDE: usize = 1000;

/// What the shared overflow store does once it holds `capacity` tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Grow without bound.
    #[default]
    Unbounded,
    /// Past `capacity`, keep accepting tasks on a slower auxiliary spill stack.
    Spill {
        /// Tasks held in the fast store before spilling.
        capacity: usize,
    },
    /// Past `capacity`, reject pushes with [`MarkError::QueueExhausted`].
    ///
    /// [`MarkError::QueueExhausted`]: crate::MarkError::QueueExhausted
    Fail {
        /// Hard limit on tasks held in the store.
        capacity: usize,
    },
}

impl OverflowPolicy {
    /// Capacity of the fast store, if bounded.
    #[must_use]
    pub const fn capacity(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Spill { capacity } | Self::Fail { capacity } => Some(capacity),
        }
    }
}

/// Configuration for the concurrent marking engine.
#[derive(Clone, Copy, Debug)]
pub struct MarkConfig {
    /// Number of parallel marking workers.
    pub workers: usize,
    /// Minimum chunk width for array splitting. Arrays of at most twice this
    /// length are scanned in one go.
    pub stride: usize,
    /// Capacity of each worker's bounded local store. Must be a power of two.
    pub local_queue_capacity: usize,
    /// Behavior of the shared overflow store when it fills up.
    pub overflow: OverflowPolicy,
    /// Per-worker live-data counters are flushed to the region once they would
    /// reach this many words.
    pub live_data_flush_threshold: u32,
    /// Tasks processed between pacer progress reports and cancellation polls.
    pub progress_report_stride: usize,
    /// Failed steal rounds before an idle worker yields its time slice.
    pub steal_attempts_before_yield: u32,
    /// Whether newly marked objects are offered to string deduplication.
    pub dedup: bool,
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            stride: DEFAULT_ARRAY_STRIDE,
            local_queue_capacity: DEFAULT_LOCAL_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Unbounded,
            live_data_flush_threshold: DEFAULT_LIVE_DATA_FLUSH_THRESHOLD,
            progress_report_stride: DEFAULT_PROGRESS_REPORT_STRIDE,
            steal_attempts_before_yield: 10,
            dedup: false,
        }
    }
}

impl MarkConfig {
    /// Create a configuration with the given worker count.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..Default::default()
        }
    }

    /// Set the number of marking workers (at least one).
    pub const fn set_workers(&mut self, workers: usize) {
        self.workers = if workers < 1 { 1 } else { workers };
    }

    /// Set the array chunk stride.
    pub const fn set_stride(&mut self, stride: usize) {
        self.stride = stride;
    }

    /// Set the overflow policy.
    pub const fn set_overflow(&mut self, overflow: OverflowPolicy) {
        self.overflow = overflow;
    }

    /// Enable or disable string deduplication candidates.
    pub const fn set_dedup(&mut self, enabled: bool) {
        self.dedup = enabled;
    }

    /// Check every knob for sanity.
    ///
    /// # Errors
    ///
    /// Returns the first offending value as a [`ConfigError`].
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.stride == 0 {
            return Err(ConfigError::ZeroStride);
        }
        if self.local_queue_capacity < 2 || !self.local_queue_capacity.is_power_of_two() {
            return Err(ConfigError::BadQueueCapacity(self.local_queue_capacity));
        }
        if let Some(0) = self.overflow.capacity() {
            return Err(ConfigError::ZeroOverflowCapacity);
        }
        if self.live_data_flush_threshold == 0 {
            return Err(ConfigError::ZeroFlushThreshold);
        }
        Ok(())
    }
}

/// Configuration for the allocation pacer.
#[derive(Clone, Copy, Debug)]
pub struct PacingConfig {
    /// When disabled, every claim succeeds and reports are ignored.
    pub enabled: bool,
    /// Longest an allocating thread is stalled before it force-claims.
    pub max_delay: Duration,
    /// Percent of max capacity that can be allocated freely while idle.
    pub idle_slack_percent: usize,
    /// Percent of free space that can be allocated freely during a cycle.
    pub cycle_slack_percent: usize,
    /// Extra tax applied on top of the computed rate, to help the collector
    /// get ahead of allocations.
    pub surcharge: f64,
    /// Number of past mark phases averaged to forecast live data.
    pub history_len: usize,
    /// Live-data forecast for the very first cycle, in percent of max capacity.
    pub initial_live_percent: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_delay: Duration::from_millis(10),
            idle_slack_percent: 2,
            cycle_slack_percent: 10,
            surcharge: 1.1,
            history_len: 5,
            initial_live_percent: 10,
        }
    }
}

impl PacingConfig {
    /// A configuration with pacing turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the maximum stall for a single allocation.
    pub const fn set_max_delay(&mut self, max_delay: Duration) {
        self.max_delay = max_delay;
    }

    /// Check every knob for sanity.
    ///
    /// # Errors
    ///
    /// Returns the first offending value as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("idle_slack_percent", self.idle_slack_percent),
            ("cycle_slack_percent", self.cycle_slack_percent),
            ("initial_live_percent", self.initial_live_percent),
        ] {
            if value > 100 {
                return Err(ConfigError::BadPercent { name, value });
            }
        }
        if !self.surcharge.is_finite() || self.surcharge < 1.0 {
            return Err(ConfigError::BadSurcharge(self.surcharge));
        }
        if self.history_len == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        Ok(())
    }
}
