//! Snapshot-at-the-beginning buffers.
//!
//! While marking is active, every mutator's pre-write barrier logs the value a
//! reference slot held before it is overwritten. Values collect in a private
//! [`SatbMarkQueue`]; full buffers are handed to the shared [`SatbQueueSet`],
//! from which marking workers drain them through a [`SatbBufferClosure`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::error::MarkResult;
use crate::heap::Heap;
use crate::mark::concurrent::{mark_through_ref, UpdateRefsMode};
use crate::mark::splitter::TaskSink;
use crate::oop::{ObjRef, RefEncoding, RefSlot};

/// Entries per mutator buffer.
pub const DEFAULT_SATB_BUFFER_SIZE: usize = 1024;

/// A completed buffer of logged values.
pub type SatbBuffer = Box<[RefSlot]>;

/// Completed buffers shared between mutators and marking workers.
#[derive(Debug)]
pub struct SatbQueueSet {
    completed: SegQueue<SatbBuffer>,
    completed_len: AtomicUsize,
    buffer_capacity: usize,
    encoding: RefEncoding,
    active: AtomicBool,
}

impl SatbQueueSet {
    /// Create an inactive set whose mutator buffers hold `buffer_capacity`
    /// entries stored with `encoding`.
    #[must_use]
    pub fn new(buffer_capacity: usize, encoding: RefEncoding) -> Self {
        assert!(buffer_capacity > 0, "SATB buffers need room for one entry");
        Self {
            completed: SegQueue::new(),
            completed_len: AtomicUsize::new(0),
            buffer_capacity,
            encoding,
            active: AtomicBool::new(false),
        }
    }

    /// Switch the pre-write barrier on or off.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Whether mutators should log pre-write values.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Entries per mutator buffer.
    #[must_use]
    pub const fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Hand over a buffer filled by a mutator.
    pub fn enqueue_completed_buffer(&self, buffer: SatbBuffer) {
        if buffer.is_empty() {
            return;
        }
        self.completed_len.fetch_add(1, Ordering::Release);
        self.completed.push(buffer);
    }

    /// Number of buffers waiting to be drained.
    #[must_use]
    pub fn completed_buffers(&self) -> usize {
        self.completed_len.load(Ordering::Acquire)
    }

    /// Take one completed buffer and apply `cl` to it.
    ///
    /// Returns `false` when no buffer was available.
    ///
    /// # Errors
    ///
    /// Propagates errors from the closure.
    pub fn apply_closure_to_completed_buffer<H, S>(
        &self,
        cl: &mut SatbBufferClosure<'_, H, S>,
    ) -> MarkResult<bool>
    where
        H: Heap + ?Sized,
        S: TaskSink + ?Sized,
    {
        let Some(buffer) = self.completed.pop() else {
            return Ok(false);
        };
        self.completed_len.fetch_sub(1, Ordering::AcqRel);
        cl.do_buffer(&buffer)?;
        Ok(true)
    }

    /// Discard every completed buffer and deactivate. Used when marking is
    /// cancelled.
    pub fn abandon_partial_marking(&self) {
        self.set_active(false);
        while self.completed.pop().is_some() {
            self.completed_len.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A mutator's private log of pre-write values.
///
/// Partially filled buffers are handed over on [`flush`](Self::flush) and on
/// drop.
#[derive(Debug)]
pub struct SatbMarkQueue {
    set: Arc<SatbQueueSet>,
    buffer: Vec<RefSlot>,
}

impl SatbMarkQueue {
    /// Create a mutator queue feeding `set`.
    #[must_use]
    pub fn new(set: Arc<SatbQueueSet>) -> Self {
        let buffer = Vec::with_capacity(set.buffer_capacity());
        Self { set, buffer }
    }

    /// Log `pre_value`, the reference about to be overwritten.
    pub fn enqueue(&mut self, pre_value: ObjRef) {
        if pre_value.is_null() || !self.set.is_active() {
            return;
        }
        self.buffer.push(RefSlot::new(pre_value, self.set.encoding));
        if self.buffer.len() == self.set.buffer_capacity() {
            self.flush();
        }
    }

    /// Hand the current buffer to the shared set.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let full = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.set.buffer_capacity()),
        );
        self.set.enqueue_completed_buffer(full.into_boxed_slice());
    }

    /// Entries logged but not yet handed over.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for SatbMarkQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Marks every value of a snapshot buffer.
pub struct SatbBufferClosure<'a, H: Heap + ?Sized, S: TaskSink + ?Sized> {
    heap: &'a H,
    queue: &'a S,
}

impl<'a, H: Heap + ?Sized, S: TaskSink + ?Sized> SatbBufferClosure<'a, H, S> {
    /// Create a closure pushing new work to `queue`.
    #[must_use]
    pub const fn new(heap: &'a H, queue: &'a S) -> Self {
        Self { heap, queue }
    }

    /// Mark through every entry of `buffer`.
    ///
    /// Logged values may point at old copies of relocated objects, so they are
    /// resolved whenever the heap holds forwarded objects. The buffer itself is
    /// never updated.
    ///
    /// # Errors
    ///
    /// Propagates queue exhaustion.
    pub fn do_buffer(&mut self, buffer: &[RefSlot]) -> MarkResult<()> {
        let mode = if self.heap.has_forwarded_objects() {
            UpdateRefsMode::Resolve
        } else {
            UpdateRefsMode::None
        };
        for slot in buffer {
            mark_through_ref(self.heap, slot, self.queue, mode, None)?;
        }
        Ok(())
    }
}
