//! Allocation pacing.
//!
//! A simple tax-and-spend policy: collector threads earn credit by reporting
//! work, allocating threads spend it, and allocators that find the budget
//! empty are stalled until credit arrives, the phase changes, the cycle is
//! cancelled, or the maximum delay runs out.
//!
//! The budget is counted in allocation words. Each phase setup re-baselines it
//! with a non-taxable allowance and a tax rate: the number of allocation words
//! granted per word of collector work, chosen so that the expected amount of
//! collector work completes before the free space is used up.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::config::PacingConfig;
use crate::error::MarkResult;
use crate::heap::{Heap, HEAP_WORD_SIZE};
use crate::metrics::{DelayHistogram, TruncatedSeq};

mod budget;

pub use budget::PacerBudget;

/// Collector phase the pacer is calibrated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacerPhase {
    /// No cycle in progress.
    Idle = 0,
    /// Concurrent marking.
    Mark = 1,
    /// Concurrent evacuation.
    Evac = 2,
    /// Concurrent reference updating.
    UpdateRefs = 3,
}

impl PacerPhase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Mark,
            2 => Self::Evac,
            3 => Self::UpdateRefs,
            _ => Self::Idle,
        }
    }
}

/// How a stalled allocation was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceOutcome {
    /// Enough budget was available, possibly after waiting.
    Claimed,
    /// The phase changed while waiting; the claim no longer applies.
    EpochAdvanced,
    /// The cycle was cancelled while waiting.
    Cancelled,
    /// The maximum delay ran out and the budget was force-claimed.
    TimedOut,
}

const INITIAL_WAIT: Duration = Duration::from_millis(1);

/// The allocation pacer.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tidemark::test_util::TestHeap;
/// use tidemark::{PaceOutcome, Pacer, PacingConfig};
///
/// let heap = Arc::new(TestHeap::new(16, 1024));
/// let pacer = Pacer::new(heap, PacingConfig::default()).unwrap();
/// pacer.setup_for_idle();
///
/// assert!(pacer.claim_for_alloc(8, false));
/// assert_eq!(pacer.pace_for_alloc(8), PaceOutcome::Claimed);
/// ```
pub struct Pacer<H: Heap> {
    heap: Arc<H>,
    config: PacingConfig,
    budget: CachePadded<PacerBudget>,
    tax_rate: AtomicU64,
    epoch: AtomicUsize,
    progress: CachePadded<AtomicUsize>,
    progress_initialized: Mutex<bool>,
    progress_history: Mutex<TruncatedSeq>,
    phase: AtomicU8,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
    stalled: AtomicUsize,
    delays: DelayHistogram,
}

impl<H: Heap> Pacer<H> {
    /// Create a pacer for `heap`. The budget starts empty; call one of the
    /// `setup_for_*` methods before use.
    ///
    /// # Errors
    ///
    /// Returns [`MarkError::InvalidConfig`](crate::MarkError::InvalidConfig)
    /// when `config` does not validate.
    pub fn new(heap: Arc<H>, config: PacingConfig) -> MarkResult<Self> {
        config.validate()?;
        Ok(Self {
            heap,
            progress_history: Mutex::new(TruncatedSeq::new(config.history_len)),
            config,
            budget: CachePadded::new(PacerBudget::new(0)),
            tax_rate: AtomicU64::new(1.0f64.to_bits()),
            epoch: AtomicUsize::new(0),
            progress: CachePadded::new(AtomicUsize::new(0)),
            progress_initialized: Mutex::new(false),
            phase: AtomicU8::new(PacerPhase::Idle as u8),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
            stalled: AtomicUsize::new(0),
            delays: DelayHistogram::new(),
        })
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Current budget in allocation words. May be negative after forced claims.
    #[must_use]
    pub fn budget(&self) -> isize {
        self.budget.load()
    }

    /// Allocation words granted per word of collector work.
    #[must_use]
    pub fn tax_rate(&self) -> f64 {
        f64::from_bits(self.tax_rate.load(Ordering::Acquire))
    }

    /// Phase-change counter. Advances on every setup.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Phase the pacer is calibrated for.
    #[must_use]
    pub fn phase(&self) -> PacerPhase {
        PacerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Marking progress reported since the last mark setup, in words.
    #[must_use]
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    /// Allocating threads currently stalled.
    #[must_use]
    pub fn stalled_threads(&self) -> usize {
        self.stalled.load(Ordering::Acquire)
    }

    /// Histogram of stalls so far.
    #[must_use]
    pub const fn delays(&self) -> &DelayHistogram {
        &self.delays
    }

    // ---- phase setup ----

    /// Calibrate for the idle phase: a small free allowance, untaxed.
    pub fn setup_for_idle(&self) {
        let initial = percent_of(self.heap.max_capacity_bytes(), self.config.idle_slack_percent);
        self.restart_with(PacerPhase::Idle, initial, 1.0);
    }

    /// Calibrate for marking, forecasting live data from past cycles.
    #[allow(clippy::cast_precision_loss)]
    pub fn setup_for_mark(&self) {
        let live = self.update_and_get_progress_history();
        let (non_taxable, taxable) = self.split_free();
        let rate = taxable as f64 / (live.max(1) as f64 * self.config.surcharge);
        self.restart_with(PacerPhase::Mark, non_taxable, rate);
    }

    /// Calibrate for evacuation. Every collection-set byte is read and may be
    /// written, so evacuation work is twice its size.
    #[allow(clippy::cast_precision_loss)]
    pub fn setup_for_evac(&self) {
        let cset = self.heap.collection_set_used_bytes();
        let (non_taxable, taxable) = self.split_free();
        let work = cset.saturating_mul(2).max(1);
        let rate = (taxable as f64 / work as f64).min(1.0) / self.config.surcharge;
        self.restart_with(PacerPhase::Evac, non_taxable, rate);
    }

    /// Calibrate for reference updating, which walks all used memory.
    #[allow(clippy::cast_precision_loss)]
    pub fn setup_for_update_refs(&self) {
        let used = self.heap.used_bytes();
        let (non_taxable, taxable) = self.split_free();
        let rate = (taxable as f64 / used.max(1) as f64).min(1.0) / self.config.surcharge;
        self.restart_with(PacerPhase::UpdateRefs, non_taxable, rate);
    }

    /// Re-baseline the budget and tax rate and wake every stalled allocator.
    pub fn restart_with(&self, phase: PacerPhase, non_taxable_bytes: usize, tax_rate: f64) {
        let initial = isize::try_from(non_taxable_bytes / HEAP_WORD_SIZE).unwrap_or(isize::MAX);
        self.budget.reset(initial);
        self.tax_rate.store(tax_rate.to_bits(), Ordering::Release);
        self.phase.store(phase as u8, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        crate::tracing::log_pacer_setup(phase, initial, tax_rate, epoch);
        self.wake_all();
    }

    fn split_free(&self) -> (usize, usize) {
        let free = self.heap.free_bytes();
        let non_taxable = percent_of(free, self.config.cycle_slack_percent);
        (non_taxable, free - non_taxable)
    }

    /// Record last cycle's marking work and forecast the next one, in bytes.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn update_and_get_progress_history(&self) -> usize {
        let mut initialized = self.progress_initialized.lock();
        let progress = self.progress.swap(0, Ordering::AcqRel);
        if !*initialized {
            // First cycle: nothing measured yet.
            *initialized = true;
            return percent_of(self.heap.max_capacity_bytes(), self.config.initial_live_percent);
        }
        let mut history = self.progress_history.lock();
        history.add(progress as f64);
        (history.avg() * HEAP_WORD_SIZE as f64) as usize
    }

    // ---- collector side ----

    /// Credit the budget for `words` of collector work and count them as
    /// marking progress.
    pub fn report_progress(&self, words: usize) {
        if !self.config.enabled {
            return;
        }
        self.progress.fetch_add(words, Ordering::Relaxed);
        self.credit(words);
    }

    /// Report marking work.
    pub fn report_mark(&self, words: usize) {
        self.report_progress(words);
    }

    /// Report evacuation work.
    pub fn report_evac(&self, words: usize) {
        if self.config.enabled {
            self.credit(words);
        }
    }

    /// Report reference-updating work.
    pub fn report_update_refs(&self, words: usize) {
        if self.config.enabled {
            self.credit(words);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn credit(&self, words: usize) {
        self.budget.credit(words as f64 * self.tax_rate());
    }

    // ---- allocator side ----

    /// Try to take `words` from the budget.
    ///
    /// Without `force`, fails when the budget cannot cover the claim and the
    /// budget is left untouched. With `force`, always succeeds, possibly
    /// driving the budget negative.
    pub fn claim_for_alloc(&self, words: usize, force: bool) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.budget.try_claim(alloc_cost(words), force)
    }

    /// Return `words` claimed at `epoch` that turned out not to be needed.
    /// Claims from an earlier epoch are ignored: the budget was re-baselined
    /// since.
    pub fn unpace_for_alloc(&self, epoch: usize, words: usize) {
        if !self.config.enabled || epoch != self.epoch() {
            return;
        }
        self.budget.refund(alloc_cost(words));
    }

    /// Claim `words`, stalling the calling thread until the claim succeeds,
    /// the epoch advances, the cycle is cancelled, or
    /// [`PacingConfig::max_delay`] runs out.
    pub fn pace_for_alloc(&self, words: usize) -> PaceOutcome {
        if self.claim_for_alloc(words, false) {
            return PaceOutcome::Claimed;
        }

        let epoch = self.epoch();
        let max = self.config.max_delay;
        let start = Instant::now();
        let mut wait = Duration::ZERO;
        self.stalled.fetch_add(1, Ordering::AcqRel);

        let outcome = loop {
            if self.heap.cancelled_gc() {
                break PaceOutcome::Cancelled;
            }
            let elapsed = start.elapsed();
            if elapsed >= max {
                // Out of patience: allocate anyway and let the collector
                // replenish the budget.
                self.claim_for_alloc(words, true);
                break PaceOutcome::TimedOut;
            }

            // Exponential backoff bounded by what is left of the delay.
            wait = (wait * 2).max(INITIAL_WAIT).min(max - elapsed);
            {
                let mut guard = self.wait_lock.lock();
                if self.epoch() == epoch && !self.heap.cancelled_gc() {
                    self.wait_cv.wait_for(&mut guard, wait);
                }
            }

            if self.epoch() != epoch {
                break PaceOutcome::EpochAdvanced;
            }
            if self.claim_for_alloc(words, false) {
                break PaceOutcome::Claimed;
            }
        };

        self.stalled.fetch_sub(1, Ordering::AcqRel);
        let waited = start.elapsed();
        self.delays.record(waited);
        crate::tracing::log_pacer_stall(words, outcome, waited);
        outcome
    }

    /// Wake stalled allocators so they observe a cancelled cycle.
    pub fn notify_cancelled(&self) {
        self.wake_all();
    }

    fn wake_all(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }
}

impl<H: Heap> fmt::Display for Pacer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ALLOCATION PACING:")?;
        writeln!(f)?;
        writeln!(
            f,
            "Max pacing delay is set for {} ms.",
            self.config.max_delay.as_millis()
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "Higher delay keeps the application from outpacing the collector, but hides collector"
        )?;
        writeln!(
            f,
            "latency from pause times: stalls add to end-to-end latency of individual threads."
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "Phase: {:?}, epoch: {}, budget: {} words, tax rate: {:.3}",
            self.phase(),
            self.epoch(),
            self.budget(),
            self.tax_rate()
        )?;
        writeln!(f)?;
        writeln!(f, "Actual pacing delays histogram:")?;
        writeln!(f)?;
        write!(f, "{}", self.delays)
    }
}

impl<H: Heap> fmt::Debug for Pacer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pacer")
            .field("phase", &self.phase())
            .field("epoch", &self.epoch())
            .field("budget", &self.budget())
            .field("tax_rate", &self.tax_rate())
            .finish_non_exhaustive()
    }
}

fn alloc_cost(words: usize) -> isize {
    isize::try_from(words).unwrap_or(isize::MAX).max(1)
}

const fn percent_of(bytes: usize, percent: usize) -> usize {
    bytes / 100 * percent + bytes % 100 * percent / 100
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::TestHeap;
    use std::thread;

    fn pacer(config: PacingConfig) -> (Arc<TestHeap>, Pacer<TestHeap>) {
        let heap = Arc::new(TestHeap::new(16, 1024));
        let pacer = Pacer::new(Arc::clone(&heap), config).unwrap();
        (heap, pacer)
    }

    fn wait_until_stalled<H: Heap>(pacer: &Pacer<H>) {
        while pacer.stalled_threads() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_idle_setup_grants_slack() {
        let (heap, pacer) = pacer(PacingConfig::default());
        pacer.setup_for_idle();

        let expected = heap.max_capacity_bytes() * 2 / 100 / HEAP_WORD_SIZE;
        assert_eq!(pacer.budget(), isize::try_from(expected).unwrap());
        assert!((pacer.tax_rate() - 1.0).abs() < f64::EPSILON);
        assert_eq!(pacer.phase(), PacerPhase::Idle);
        assert_eq!(pacer.epoch(), 1);
    }

    #[test]
    fn test_unforced_claim_never_goes_negative() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.restart_with(PacerPhase::Mark, 10 * HEAP_WORD_SIZE, 1.0);

        assert!(pacer.claim_for_alloc(6, false));
        assert!(!pacer.claim_for_alloc(6, false));
        assert_eq!(pacer.budget(), 4);

        assert!(pacer.claim_for_alloc(6, true));
        assert_eq!(pacer.budget(), -2);
    }

    #[test]
    fn test_zero_word_claim_costs_one() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.restart_with(PacerPhase::Mark, HEAP_WORD_SIZE, 1.0);
        assert!(pacer.claim_for_alloc(0, false));
        assert_eq!(pacer.budget(), 0);
        assert!(!pacer.claim_for_alloc(0, false));
    }

    #[test]
    fn test_progress_is_taxed() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.restart_with(PacerPhase::Mark, 0, 2.5);
        pacer.report_mark(100);
        assert_eq!(pacer.budget(), 250);
        assert_eq!(pacer.progress(), 100);

        pacer.report_evac(10);
        assert_eq!(pacer.budget(), 275);
        assert_eq!(pacer.progress(), 100);
    }

    #[test]
    fn test_sub_word_credit_is_not_lost() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.restart_with(PacerPhase::Evac, 0, 0.5);
        for _ in 0..100 {
            pacer.report_evac(1);
        }
        assert_eq!(pacer.budget(), 50);

        pacer.restart_with(PacerPhase::UpdateRefs, 0, 1.0 / 3.0);
        for _ in 0..9 {
            pacer.report_update_refs(1);
        }
        // Nine thirds may round to just under three words.
        assert!((2..=3).contains(&pacer.budget()));
    }

    #[test]
    fn test_stale_unpace_is_ignored() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.restart_with(PacerPhase::Mark, 0, 1.0);
        let stale = pacer.epoch();
        pacer.restart_with(PacerPhase::Evac, 0, 1.0);

        pacer.unpace_for_alloc(stale, 100);
        assert_eq!(pacer.budget(), 0);

        pacer.unpace_for_alloc(pacer.epoch(), 100);
        assert_eq!(pacer.budget(), 100);
    }

    #[test]
    fn test_first_mark_forecast_uses_initial_live() {
        let (heap, pacer) = pacer(PacingConfig::default());
        pacer.setup_for_mark();

        let free = heap.free_bytes();
        let non_taxable = free / 10;
        let live = heap.max_capacity_bytes() / 10;
        let expected = (free - non_taxable) as f64 / (live as f64 * 1.1);
        assert!((pacer.tax_rate() - expected).abs() < 1e-9);
        assert_eq!(
            pacer.budget(),
            isize::try_from(non_taxable / HEAP_WORD_SIZE).unwrap()
        );
    }

    #[test]
    fn test_mark_forecast_averages_history() {
        let (heap, pacer) = pacer(PacingConfig::default());
        pacer.setup_for_mark();
        pacer.report_mark(1000);
        pacer.setup_for_mark();
        pacer.report_mark(3000);
        pacer.setup_for_mark();

        // Forecast is the mean of 1000 and 3000 words.
        let free = heap.free_bytes();
        let taxable = free - free / 10;
        let live = 2000 * HEAP_WORD_SIZE;
        let expected = taxable as f64 / (live as f64 * 1.1);
        assert!((pacer.tax_rate() - expected).abs() < 1e-9);
        assert_eq!(pacer.progress(), 0);
    }

    #[test]
    fn test_evac_rate_is_capped() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        // Empty collection set: the rate saturates at 1 before the surcharge.
        pacer.setup_for_evac();
        assert!((pacer.tax_rate() - 1.0 / 1.1).abs() < 1e-9);
        assert_eq!(pacer.phase(), PacerPhase::Evac);

        pacer.setup_for_update_refs();
        assert_eq!(pacer.phase(), PacerPhase::UpdateRefs);
        assert!(pacer.tax_rate() <= 1.0);
    }

    #[test]
    fn test_disabled_pacer_is_transparent() {
        let (_heap, pacer) = pacer(PacingConfig::disabled());
        assert!(pacer.claim_for_alloc(1 << 20, false));
        assert_eq!(pacer.pace_for_alloc(1 << 20), PaceOutcome::Claimed);
        pacer.report_mark(100);
        assert_eq!(pacer.budget(), 0);
    }

    #[test]
    fn test_stall_times_out_and_forces() {
        let mut config = PacingConfig::default();
        config.set_max_delay(Duration::from_millis(5));
        let (_heap, pacer) = pacer(config);
        pacer.restart_with(PacerPhase::Mark, 0, 1.0);

        assert_eq!(pacer.pace_for_alloc(10), PaceOutcome::TimedOut);
        assert_eq!(pacer.budget(), -10);
        assert_eq!(pacer.delays().count(), 1);
    }

    #[test]
    fn test_stall_released_by_epoch() {
        let mut config = PacingConfig::default();
        config.set_max_delay(Duration::from_secs(30));
        let (_heap, pacer) = pacer(config);
        pacer.restart_with(PacerPhase::Mark, 0, 1.0);

        thread::scope(|s| {
            let stalled = s.spawn(|| pacer.pace_for_alloc(10));
            wait_until_stalled(&pacer);
            pacer.restart_with(PacerPhase::Evac, 0, 1.0);
            assert_eq!(stalled.join().unwrap(), PaceOutcome::EpochAdvanced);
        });
    }

    #[test]
    fn test_stall_released_by_progress() {
        let mut config = PacingConfig::default();
        config.set_max_delay(Duration::from_secs(30));
        let (_heap, pacer) = pacer(config);
        pacer.restart_with(PacerPhase::Mark, 0, 1.0);

        thread::scope(|s| {
            let stalled = s.spawn(|| pacer.pace_for_alloc(10));
            wait_until_stalled(&pacer);
            pacer.report_mark(100);
            assert_eq!(stalled.join().unwrap(), PaceOutcome::Claimed);
        });
        assert_eq!(pacer.budget(), 90);
    }

    #[test]
    fn test_stall_released_by_cancellation() {
        let mut config = PacingConfig::default();
        config.set_max_delay(Duration::from_secs(30));
        let (heap, pacer) = pacer(config);
        pacer.restart_with(PacerPhase::Mark, 0, 1.0);

        thread::scope(|s| {
            let stalled = s.spawn(|| pacer.pace_for_alloc(10));
            wait_until_stalled(&pacer);
            heap.cancel();
            pacer.notify_cancelled();
            let start = Instant::now();
            assert_eq!(stalled.join().unwrap(), PaceOutcome::Cancelled);
            assert!(start.elapsed() < Duration::from_secs(5));
        });
        assert_eq!(pacer.budget(), 0);
    }

    #[test]
    fn test_report_renders_histogram() {
        let (_heap, pacer) = pacer(PacingConfig::default());
        pacer.delays().record(Duration::from_micros(700));
        let report = pacer.to_string();
        assert!(report.contains("ALLOCATION PACING"));
        assert!(report.contains("Max pacing delay is set for 10 ms."));
        assert!(report.contains("Total"));
    }
}
