//! String deduplication candidates.
//!
//! Marking only discovers candidates. Deciding what qualifies and actually
//! deduplicating belongs to the embedder's [`StringDedup`] implementation,
//! which drains each worker's [`DedupQueue`] after marking.

use crossbeam_queue::SegQueue;

use crate::oop::ObjRef;

/// The deduplication subsystem as seen by marking.
pub trait StringDedup: Send + Sync {
    /// Whether deduplication is switched on.
    fn is_enabled(&self) -> bool;

    /// Whether `obj` should be offered for deduplication.
    fn is_candidate(&self, obj: ObjRef) -> bool;

    /// Hand a candidate to the subsystem.
    fn enqueue_candidate(&self, obj: ObjRef, queue: &DedupQueue) {
        queue.push(obj);
    }
}

/// Candidates found by one worker.
#[derive(Debug, Default)]
pub struct DedupQueue {
    entries: SegQueue<ObjRef>,
}

impl DedupQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate.
    pub fn push(&self, obj: ObjRef) {
        self.entries.push(obj);
    }

    /// Take the oldest candidate.
    pub fn pop(&self) -> Option<ObjRef> {
        self.entries.pop()
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no candidate is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every queued candidate.
    pub fn drain(&self) -> Vec<ObjRef> {
        std::iter::from_fn(|| self.entries.pop()).collect()
    }
}

/// A worker's view of deduplication: the policy plus its own queue.
#[derive(Clone, Copy)]
pub struct DedupSink<'a> {
    dedup: &'a dyn StringDedup,
    queue: &'a DedupQueue,
}

impl<'a> DedupSink<'a> {
    /// Pair a policy with a worker queue.
    #[must_use]
    pub fn new(dedup: &'a dyn StringDedup, queue: &'a DedupQueue) -> Self {
        Self { dedup, queue }
    }

    /// Offer a newly marked object.
    pub fn offer(&self, obj: ObjRef) {
        if self.dedup.is_candidate(obj) {
            debug_assert!(self.dedup.is_enabled(), "dedup must be enabled");
            self.dedup.enqueue_candidate(obj, self.queue);
        }
    }
}

impl std::fmt::Debug for DedupSink<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupSink")
            .field("enabled", &self.dedup.is_enabled())
            .field("queued", &self.queue.len())
            .finish()
    }
}
