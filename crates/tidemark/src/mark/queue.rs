//! Per-worker mark queues.
//!
//! Each worker owns an [`ObjToScanQueue`] made of three stores:
//!
//! - a one-task hand-off buffer holding the most recently pushed task,
//! - a bounded [`LocalQueue`] (Chase-Lev deque) that peers may steal from,
//! - the [`OverflowStore`] shared by all workers, used when the local store is
//!   full and governed by the configured [`OverflowPolicy`].
//!
//! No ordering holds across stores. Every pushed task is popped or stolen
//! exactly once.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::config::OverflowPolicy;
use crate::error::{MarkError, MarkResult};
use crate::mark::task::MarkTask;

/// Bounded lock-free work-stealing deque.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005).
///
/// The owner pushes and pops at the bottom (LIFO); thieves steal from the top
/// (FIFO). Only the owning worker may call [`push`](Self::push) and
/// [`pop`](Self::pop).
pub struct LocalQueue {
    buffer: Box<[UnsafeCell<MaybeUninit<MarkTask>>]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
}

impl LocalQueue {
    /// Create a deque holding up to `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "LocalQueue capacity must be a power of 2"
        );
        Self {
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Maximum number of tasks held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Push at the bottom. Returns `false` when full.
    pub fn push(&self, task: MarkTask) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) >= self.capacity() {
            return false;
        }

        // SAFETY: only the owner writes, and slot `b` is outside the live
        // window `[t, b)`, so no thief can be reading it.
        unsafe {
            (*self.buffer[b & self.mask].get()).write(task);
        }

        // Publish the slot before the new bottom becomes visible to thieves.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop from the bottom.
    pub fn pop(&self) -> Option<MarkTask> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        #[allow(clippy::cast_possible_wrap)]
        let size = b.wrapping_sub(t) as isize;
        if size < 0 {
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        // SAFETY: slot `b` lies in the live window and was written by push.
        let task = unsafe { (*self.buffer[b & self.mask].get()).assume_init_read() };
        if size > 0 {
            return Some(task);
        }

        // Last element: race thieves for it through `top`.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        won.then_some(task)
    }

    /// Steal from the top. May be called from any thread.
    pub fn steal(&self) -> Option<MarkTask> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        #[allow(clippy::cast_possible_wrap)]
        let size = b.wrapping_sub(t) as isize;
        if size <= 0 {
            return None;
        }

        // SAFETY: slot `t` lies in the live window; the owner cannot reuse it
        // until `top` moves past it, which only our CAS below can do.
        let task = unsafe { (*self.buffer[t & self.mask].get()).assume_init_read() };
        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| task)
    }

    /// Approximate number of tasks held.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_wrap)]
        let len = b.wrapping_sub(t) as isize;
        len.max(0).unsigned_abs()
    }

    /// Whether the deque looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// SAFETY: LocalQueue is safe to share between threads because:
// - slots are written only by the owner, outside the window thieves read
// - `top` is advanced only by CAS, so each slot is claimed at most once
// - `bottom` is written only by the owner
// - MarkTask is a plain word with no drop glue
unsafe impl Send for LocalQueue {}

// SAFETY: See Send impl
unsafe impl Sync for LocalQueue {}

/// Overflow storage shared by all workers of a marking cycle.
pub struct OverflowStore {
    tasks: SegQueue<MarkTask>,
    len: AtomicUsize,
    policy: OverflowPolicy,
    spill: Mutex<Vec<MarkTask>>,
    spill_len: AtomicUsize,
    spill_reported: AtomicBool,
}

impl OverflowStore {
    /// Create an empty store with the given exhaustion policy.
    #[must_use]
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            tasks: SegQueue::new(),
            len: AtomicUsize::new(0),
            policy,
            spill: Mutex::new(Vec::new()),
            spill_len: AtomicUsize::new(0),
            spill_reported: AtomicBool::new(false),
        }
    }

    /// The exhaustion policy in force.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Add a task.
    ///
    /// # Errors
    ///
    /// Returns [`MarkError::QueueExhausted`] when the store is at capacity
    /// under [`OverflowPolicy::Fail`].
    pub fn push(&self, task: MarkTask) -> MarkResult<()> {
        let Some(capacity) = self.policy.capacity() else {
            self.len.fetch_add(1, Ordering::Relaxed);
            self.tasks.push(task);
            return Ok(());
        };

        if self.len.fetch_add(1, Ordering::AcqRel) < capacity {
            self.tasks.push(task);
            return Ok(());
        }
        self.len.fetch_sub(1, Ordering::AcqRel);

        match self.policy {
            OverflowPolicy::Fail { .. } => Err(MarkError::QueueExhausted { capacity }),
            _ => {
                if !self.spill_reported.swap(true, Ordering::Relaxed) {
                    crate::tracing::log_overflow_spill(capacity);
                }
                self.spill.lock().push(task);
                self.spill_len.fetch_add(1, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Take a task, preferring the fast store over the spill stack.
    pub fn pop(&self) -> Option<MarkTask> {
        if let Some(task) = self.tasks.pop() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Some(task);
        }
        if self.spill_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let task = self.spill.lock().pop()?;
        self.spill_len.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    /// Approximate number of tasks held, spilled ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len() + self.spill_len.load(Ordering::Acquire)
    }

    /// Whether the store looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks currently on the spill stack.
    #[must_use]
    pub fn spilled(&self) -> usize {
        self.spill_len.load(Ordering::Acquire)
    }
}

impl Default for OverflowStore {
    fn default() -> Self {
        Self::new(OverflowPolicy::Unbounded)
    }
}

/// A marking worker's task queue.
///
/// The owner pushes and pops; peers may only [`steal`](Self::steal).
pub struct ObjToScanQueue {
    id: usize,
    /// Hand-off buffer, zero when empty. A valid task is never zero because
    /// it always carries a non-null object.
    buffer: AtomicU64,
    local: LocalQueue,
    overflow: Arc<OverflowStore>,
}

impl ObjToScanQueue {
    /// Create worker `id`'s queue with a local store of `capacity` tasks.
    #[must_use]
    pub fn new(id: usize, capacity: usize, overflow: Arc<OverflowStore>) -> Self {
        Self {
            id,
            buffer: AtomicU64::new(0),
            local: LocalQueue::new(capacity),
            overflow,
        }
    }

    /// Worker index owning this queue.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Push a task. The previous buffered task moves to the local store, or to
    /// the overflow store when the local store is full.
    ///
    /// # Errors
    ///
    /// Propagates [`MarkError::QueueExhausted`] from the overflow store.
    pub fn push(&self, task: MarkTask) -> MarkResult<()> {
        let prev = self.buffer.swap(task.to_raw(), Ordering::Relaxed);
        if prev == 0 {
            return Ok(());
        }
        let prev = MarkTask::from_raw(prev);
        if self.local.push(prev) {
            Ok(())
        } else {
            self.overflow.push(prev)
        }
    }

    /// Take the buffered task.
    pub fn pop_buffer(&self) -> Option<MarkTask> {
        match self.buffer.swap(0, Ordering::Relaxed) {
            0 => None,
            raw => Some(MarkTask::from_raw(raw)),
        }
    }

    /// Pop from the local store.
    pub fn pop_local(&self) -> Option<MarkTask> {
        self.local.pop()
    }

    /// Pop from the shared overflow store.
    pub fn pop_overflow(&self) -> Option<MarkTask> {
        self.overflow.pop()
    }

    /// Steal from this queue's local store. Called by peers.
    pub fn steal(&self) -> Option<MarkTask> {
        self.local.steal()
    }

    /// Whether the buffer and local store are both empty. The shared overflow
    /// store is not consulted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.load(Ordering::Relaxed) == 0 && self.local.is_empty()
    }

    /// The shared overflow store.
    #[must_use]
    pub const fn overflow(&self) -> &Arc<OverflowStore> {
        &self.overflow
    }
}
