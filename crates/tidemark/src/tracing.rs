//! Marking and pacing tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured spans
//! and events for marking cycles, overflow spills and pacer phase changes.
//! Without the feature every helper is an empty inline function.

/// Run identifiers and span constructors.
#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Stable identifier for one `mark_parallel` run.
    ///
    /// Correlates the worker spans and the start/end events of a single run.
    /// Monotonically increasing from 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MarkId(pub u64);

    static NEXT_MARK_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique mark id.
    pub fn next_mark_id() -> MarkId {
        MarkId(NEXT_MARK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span covering a whole marking run.
    pub fn trace_mark_cycle(mark_id: MarkId, workers: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "mark_cycle", mark_id = mark_id.0, workers).entered()
    }

    /// Create a span for one worker's loop.
    pub fn span_mark_worker(mark_id: MarkId, worker: usize) -> span::Span {
        tracing::debug_span!("mark_worker", mark_id = mark_id.0, worker)
    }
}

/// Run identifiers and span constructors.
#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MarkId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_mark_id() -> MarkId {
        MarkId(0)
    }
}

pub use internal::MarkId;

use crate::mark::concurrent::UpdateRefsMode;
use crate::metrics::MarkStats;
use crate::pacer::{PaceOutcome, PacerPhase};

/// Log the start of a marking run.
#[cfg(feature = "tracing")]
pub fn log_mark_start(mark_id: MarkId, mode: UpdateRefsMode) {
    tracing::debug!(mark_id = mark_id.0, mode = ?mode, "mark_start");
}

/// Log the end of a marking run.
#[cfg(feature = "tracing")]
pub fn log_mark_end(mark_id: MarkId, stats: &MarkStats) {
    tracing::debug!(
        mark_id = mark_id.0,
        outcome = ?stats.outcome,
        tasks = stats.total_tasks(),
        words = stats.total_words(),
        steals = stats.total_steals(),
        elapsed_us = u64::try_from(stats.elapsed.as_micros()).unwrap_or(u64::MAX),
        "mark_end"
    );
}

/// Log the first spill of the overflow store in a run.
#[cfg(feature = "tracing")]
pub fn log_overflow_spill(capacity: usize) {
    tracing::warn!(capacity, "overflow_spill");
}

/// Log a pacer phase change.
#[cfg(feature = "tracing")]
pub fn log_pacer_setup(phase: PacerPhase, budget_words: isize, tax_rate: f64, epoch: usize) {
    tracing::info!(
        phase = ?phase,
        budget_words,
        tax_rate,
        epoch,
        "pacer_setup"
    );
}

/// Log an allocation stall that had to wait.
#[cfg(feature = "tracing")]
pub fn log_pacer_stall(words: usize, outcome: PaceOutcome, waited: std::time::Duration) {
    tracing::debug!(
        words,
        outcome = ?outcome,
        waited_us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
        "pacer_stall"
    );
}

/// Stub function when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub const fn log_mark_start(_mark_id: MarkId, _mode: UpdateRefsMode) {}

/// Stub function when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub const fn log_mark_end(_mark_id: MarkId, _stats: &MarkStats) {}

/// Stub function when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub const fn log_overflow_spill(_capacity: usize) {}

/// Stub function when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub const fn log_pacer_setup(
    _phase: PacerPhase,
    _budget_words: isize,
    _tax_rate: f64,
    _epoch: usize,
) {
}

/// Stub function when tracing is disabled.
#[cfg(not(feature = "tracing"))]
#[inline]
pub const fn log_pacer_stall(_words: usize, _outcome: PaceOutcome, _waited: std::time::Duration) {}
