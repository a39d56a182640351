//! Parallel marking workers.
//!
//! [`ConcurrentMark::mark_parallel`] runs one worker per queue on scoped
//! threads. Each worker drains its own queue, then snapshot buffers, then
//! steals from its peers, and finally offers termination through the shared
//! [`MarkTerminator`]. Marking terminates once every worker is idle at the same
//! time with no work left anywhere.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::error::MarkResult;
use crate::heap::Heap;
use crate::mark::concurrent::{ConcurrentMark, MarkRefsClosure, UpdateRefsMode};
use crate::mark::live_data::LiveData;
use crate::mark::queue::ObjToScanQueue;
use crate::mark::satb::SatbBufferClosure;
use crate::mark::task::MarkTask;
use crate::metrics::{MarkOutcome, MarkStats, WorkerStats};

/// Longest an idle worker sleeps before re-checking for work.
const TERMINATION_WAIT: Duration = Duration::from_millis(1);

/// Termination protocol shared by the workers of one marking run.
///
/// A worker that runs out of work calls
/// [`offer_termination`](Self::offer_termination) and counts itself idle.
/// Idle workers never push, so once all of them are idle every queue is
/// empty and marking is complete.
#[derive(Debug)]
pub struct MarkTerminator {
    workers: usize,
    idle: AtomicUsize,
    complete: AtomicBool,
    aborted: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl MarkTerminator {
    /// Create a terminator for `workers` workers.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        debug_assert!(workers > 0);
        Self {
            workers,
            idle: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Number of participating workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Workers currently idle.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Whether the run is over, normally or not.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Whether the run was stopped by [`abort`](Self::abort).
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// End the run and wake every idle worker.
    pub fn set_complete(&self) {
        self.complete.store(true, Ordering::Release);
        self.notify_work_available();
    }

    /// End the run early, after cancellation or an error.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.set_complete();
    }

    /// Wake idle workers so they look for work again.
    pub fn notify_work_available(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Declare the caller idle and wait until either `has_work` reports work
    /// somewhere or the run completes.
    ///
    /// Returns `true` when the run is complete and the caller should exit,
    /// `false` when it should go back to looking for work.
    pub fn offer_termination(&self, has_work: impl Fn() -> bool) -> bool {
        self.idle.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.is_complete() {
                return true;
            }
            if has_work() {
                self.idle.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            if self.idle.load(Ordering::Acquire) == self.workers {
                self.set_complete();
                return true;
            }

            if backoff.is_completed() {
                let mut guard = self.lock.lock();
                if !self.is_complete() {
                    self.cv.wait_for(&mut guard, TERMINATION_WAIT);
                }
            } else {
                backoff.snooze();
            }
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Terminated,
    Cancelled,
}

struct MarkWorker<'a, H: Heap> {
    cm: &'a ConcurrentMark<H>,
    queue: &'a ObjToScanQueue,
    live: &'a mut LiveData,
    terminator: &'a MarkTerminator,
    stats: WorkerStats,
    unreported: usize,
}

impl<'a, H: Heap> MarkWorker<'a, H> {
    fn new(
        cm: &'a ConcurrentMark<H>,
        id: usize,
        live: &'a mut LiveData,
        terminator: &'a MarkTerminator,
    ) -> Self {
        Self {
            cm,
            queue: &cm.queues[id],
            live,
            terminator,
            stats: WorkerStats {
                worker: id,
                ..WorkerStats::default()
            },
            unreported: 0,
        }
    }

    fn run(&mut self, mode: UpdateRefsMode) -> MarkResult<Exit> {
        let cm = self.cm;
        let heap = &*cm.heap;
        let stride = cm.config.progress_report_stride.max(1);
        let mut cl = MarkRefsClosure::new(heap, self.queue, mode, cm.dedup_sink(self.stats.worker));

        loop {
            if let Some(task) = self.next_task()? {
                let words = cm.do_task(&mut cl, self.live, task)?;
                self.stats.tasks += 1;
                if task.is_not_chunked() {
                    self.stats.objects += 1;
                } else {
                    self.stats.array_chunks += 1;
                }
                self.unreported += words;

                if self.stats.tasks % stride == 0 {
                    self.report_progress();
                    if heap.cancelled_gc() {
                        return Ok(Exit::Cancelled);
                    }
                    if self.terminator.is_aborted() {
                        return Ok(Exit::Terminated);
                    }
                }
                continue;
            }

            if heap.cancelled_gc() {
                return Ok(Exit::Cancelled);
            }
            self.stats.termination_attempts += 1;
            if self.terminator.offer_termination(|| cm.has_pending_work()) {
                break;
            }
        }

        self.report_progress();
        self.live.flush(heap);
        Ok(Exit::Terminated)
    }

    fn try_queue(&self) -> Option<MarkTask> {
        self.queue
            .pop_buffer()
            .or_else(|| self.queue.pop_local())
            .or_else(|| self.queue.pop_overflow())
    }

    fn next_task(&mut self) -> MarkResult<Option<MarkTask>> {
        if let Some(task) = self.try_queue() {
            return Ok(Some(task));
        }

        let heap = &*self.cm.heap;
        let mut satb = SatbBufferClosure::new(heap, self.queue);
        while self.cm.satb.apply_closure_to_completed_buffer(&mut satb)? {
            self.stats.satb_buffers += 1;
            if let Some(task) = self.try_queue() {
                return Ok(Some(task));
            }
        }

        Ok(self.steal())
    }

    fn steal(&mut self) -> Option<MarkTask> {
        let queues = &self.cm.queues;
        let n = queues.len();
        let id = self.stats.worker;
        let backoff = Backoff::new();

        for _ in 0..self.cm.config.steal_attempts_before_yield.max(1) {
            for k in 1..n {
                if let Some(task) = queues[(id + k) % n].steal() {
                    self.stats.steals += 1;
                    return Some(task);
                }
            }
            if let Some(task) = self.queue.pop_overflow() {
                return Some(task);
            }
            backoff.snooze();
        }
        None
    }

    fn report_progress(&mut self) {
        if self.unreported == 0 {
            return;
        }
        self.stats.words += self.unreported;
        if let Some(pacer) = &self.cm.pacer {
            pacer.report_mark(self.unreported);
        }
        self.unreported = 0;
    }
}

impl<H: Heap> ConcurrentMark<H> {
    /// Mark everything reachable from the queued roots and the snapshot
    /// buffers, using one thread per configured worker.
    ///
    /// Returns when all workers agree that no work is left, or early when the
    /// heap reports cancellation. A cancelled run abandons all queued work and
    /// snapshot buffers and reports [`MarkOutcome::Cancelled`]. Snapshot
    /// buffers completed by mutators after termination are left for the
    /// caller; see [`has_pending_work`](Self::has_pending_work).
    ///
    /// # Errors
    ///
    /// Returns [`MarkError::QueueExhausted`](crate::MarkError::QueueExhausted)
    /// when the overflow store rejects a task. Queued work is abandoned.
    pub fn mark_parallel(&mut self, mode: UpdateRefsMode) -> MarkResult<MarkStats> {
        let mark_id = crate::tracing::internal::next_mark_id();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_mark_cycle(mark_id, self.queues.len());
        crate::tracing::log_mark_start(mark_id, mode);

        let start = Instant::now();
        let terminator = MarkTerminator::new(self.queues.len());
        let mut live_data = std::mem::take(&mut self.live_data);

        let results: Vec<MarkResult<(Exit, WorkerStats)>> = {
            let cm = &*self;
            let terminator = &terminator;
            thread::scope(|s| {
                let handles: Vec<_> = live_data
                    .iter_mut()
                    .enumerate()
                    .map(|(id, live)| {
                        s.spawn(move || {
                            #[cfg(feature = "tracing")]
                            let _enter =
                                crate::tracing::internal::span_mark_worker(mark_id, id).entered();
                            let mut worker = MarkWorker::new(cm, id, live, terminator);
                            let exit = worker.run(mode);
                            if !matches!(exit, Ok(Exit::Terminated)) {
                                terminator.abort();
                            }
                            exit.map(|exit| (exit, worker.stats))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| match h.join() {
                        Ok(result) => result,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            })
        };
        self.live_data = live_data;

        let mut stats = MarkStats {
            outcome: MarkOutcome::Completed,
            workers: Vec::with_capacity(results.len()),
            elapsed: Duration::ZERO,
        };
        let mut error = None;
        for result in results {
            match result {
                Ok((exit, worker)) => {
                    if exit == Exit::Cancelled {
                        stats.outcome = MarkOutcome::Cancelled;
                    }
                    stats.workers.push(worker);
                }
                Err(e) => {
                    error.get_or_insert(e);
                }
            }
        }

        if error.is_some() || stats.outcome == MarkOutcome::Cancelled {
            self.abandon();
            if let Some(pacer) = &self.pacer {
                pacer.notify_cancelled();
            }
        }
        if let Some(e) = error {
            return Err(e);
        }

        stats.elapsed = start.elapsed();
        crate::tracing::log_mark_end(mark_id, &stats);
        Ok(stats)
    }
}
