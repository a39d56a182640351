//! Marking and pacing statistics.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// How a marking run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Every reachable object was marked and no work is left.
    #[default]
    Completed,
    /// The cycle was cancelled; queues were abandoned.
    Cancelled,
}

/// Counters kept by one marking worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker index.
    pub worker: usize,
    /// Tasks dispatched.
    pub tasks: usize,
    /// Whole objects scanned.
    pub objects: usize,
    /// Array chunks scanned.
    pub array_chunks: usize,
    /// Words of marking work reported as progress.
    pub words: usize,
    /// Tasks stolen from peers.
    pub steals: usize,
    /// Snapshot buffers drained.
    pub satb_buffers: usize,
    /// Times the worker offered termination.
    pub termination_attempts: usize,
}

/// Result of a marking run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// How the run ended.
    pub outcome: MarkOutcome,
    /// Per-worker counters, indexed by worker.
    pub workers: Vec<WorkerStats>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl MarkStats {
    /// Tasks dispatched across all workers.
    #[must_use]
    pub fn total_tasks(&self) -> usize {
        self.workers.iter().map(|w| w.tasks).sum()
    }

    /// Whole objects scanned across all workers.
    #[must_use]
    pub fn total_objects(&self) -> usize {
        self.workers.iter().map(|w| w.objects).sum()
    }

    /// Words of marking work across all workers.
    #[must_use]
    pub fn total_words(&self) -> usize {
        self.workers.iter().map(|w| w.words).sum()
    }

    /// Successful steals across all workers.
    #[must_use]
    pub fn total_steals(&self) -> usize {
        self.workers.iter().map(|w| w.steals).sum()
    }

    /// Whether marking finished without cancellation.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome == MarkOutcome::Completed
    }
}

const DELAY_LEVELS: usize = 65;

/// Histogram of allocation stall durations.
///
/// Bucket `0` holds zero-length stalls; bucket `n > 0` holds stalls of
/// `[2^(n-1), 2^n)` microseconds.
#[derive(Debug)]
pub struct DelayHistogram {
    levels: [AtomicUsize; DELAY_LEVELS],
    sum_us: AtomicU64,
}

impl Default for DelayHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayHistogram {
    /// Create an empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| AtomicUsize::new(0)),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Bucket index for a stall of `us` microseconds.
    #[must_use]
    pub const fn level_of(us: u64) -> usize {
        if us == 0 {
            0
        } else {
            (u64::BITS - us.leading_zeros()) as usize
        }
    }

    /// Record one stall.
    pub fn record(&self, delay: Duration) {
        let us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.levels[Self::level_of(us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Stalls recorded in bucket `level`.
    #[must_use]
    pub fn level(&self, level: usize) -> usize {
        self.levels[level].load(Ordering::Relaxed)
    }

    /// Total stalls recorded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.levels.iter().map(|l| l.load(Ordering::Relaxed)).sum()
    }

    /// Total stall time recorded.
    #[must_use]
    pub fn sum(&self) -> Duration {
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed))
    }

    /// Lowest and highest non-empty buckets.
    #[must_use]
    pub fn level_range(&self) -> Option<(usize, usize)> {
        let min = (0..DELAY_LEVELS).find(|&l| self.level(l) > 0)?;
        let max = (0..DELAY_LEVELS).rev().find(|&l| self.level(l) > 0)?;
        Some((min, max))
    }
}

impl fmt::Display for DelayHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10} - {:>10}  {:>12}{:>12}", "From", "To", "Count", "Sum")?;
        if let Some((min, max)) = self.level_range() {
            for level in min..=max {
                let lo: u128 = if level == 0 { 0 } else { 1 << (level - 1) };
                let hi: u128 = 1 << level;
                let count = self.level(level);
                // Bucket sums are estimated from the bucket midpoint.
                let sum = u128::try_from(count).unwrap_or(u128::MAX) * (lo + hi) / 2;
                writeln!(f, "{lo:>7} us - {hi:>7} us: {count:>12}{sum:>12} us")?;
            }
        }
        writeln!(
            f,
            "{:>23}: {:>12}{:>12} us",
            "Total",
            self.count(),
            self.sum().as_micros()
        )
    }
}

/// Fixed-length window over the most recent samples.
#[derive(Debug, Clone)]
pub struct TruncatedSeq {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl TruncatedSeq {
    /// Keep the last `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest when full.
    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Mean of the retained samples, zero when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
