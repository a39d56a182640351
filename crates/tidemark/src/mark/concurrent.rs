//! Concurrent marking: the reference marking protocol and task dispatch.
//!
//! [`mark_through_ref`] is the only place where newly reachable objects enter
//! the queues. [`ConcurrentMark::do_task`] takes a task off a queue, counts
//! the object's liveness and scans it, splitting object arrays into chunks.

use std::sync::Arc;

use crate::config::MarkConfig;
use crate::error::MarkResult;
use crate::heap::{Heap, ObjectKind, SlotVisitor};
use crate::mark::asserts;
use crate::mark::bitmap::MarkingContext;
use crate::mark::dedup::{DedupQueue, DedupSink, StringDedup};
use crate::mark::live_data::LiveData;
use crate::mark::queue::{ObjToScanQueue, OverflowStore};
use crate::mark::satb::SatbQueueSet;
use crate::mark::splitter::{ArraySplitter, TaskSink};
use crate::mark::task::{chunk_range, MarkTask, TaskKind};
use crate::oop::{ObjRef, RefSlot};
use crate::pacer::Pacer;

/// How a reference is resolved against relocation before it is marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateRefsMode {
    /// Use the reference as loaded. Only valid when nothing is forwarded.
    #[default]
    None,
    /// Follow forwarding, leave the slot alone.
    Resolve,
    /// Follow forwarding and store the new location back into the slot.
    /// Only valid when no mutator can race on the slot.
    Simple,
    /// Follow forwarding and install it with a compare-and-swap. If a mutator
    /// wrote the slot first, the reference is dropped: the mutator's barrier
    /// took care of it.
    Concurrent,
}

/// Mark the object referenced from `slot` and queue it for scanning.
///
/// Exactly one caller across all threads wins the claim for an object and
/// pushes its task; every other caller returns without side effects beyond
/// the slot update requested by `mode`.
///
/// # Errors
///
/// Propagates [`MarkError::QueueExhausted`](crate::MarkError::QueueExhausted)
/// from `queue`.
pub fn mark_through_ref<H, S>(
    heap: &H,
    slot: &RefSlot,
    queue: &S,
    mode: UpdateRefsMode,
    dedup: Option<&DedupSink<'_>>,
) -> MarkResult<()>
where
    H: Heap + ?Sized,
    S: TaskSink + ?Sized,
{
    let encoding = heap.encoding();
    let loaded = slot.load(encoding);
    if loaded.is_null() {
        return Ok(());
    }

    let obj = match mode {
        UpdateRefsMode::None => loaded,
        UpdateRefsMode::Resolve => heap.resolve_forwarded(loaded),
        UpdateRefsMode::Simple => update_with_forwarded(heap, slot, loaded),
        UpdateRefsMode::Concurrent => maybe_update_with_forwarded(heap, slot, loaded),
    };

    // Only a lost race in concurrent mode produces null here.
    if obj.is_null() {
        debug_assert_eq!(mode, UpdateRefsMode::Concurrent);
        return Ok(());
    }

    asserts::assert_not_forwarded(heap, obj);
    asserts::assert_not_in_cset_except(heap, obj, heap.cancelled_gc());

    if heap.marking_context().mark(obj) {
        queue.push_task(MarkTask::object(obj))?;
        if let Some(dedup) = dedup {
            dedup.offer(obj);
        }
    }

    asserts::assert_marked(heap, obj);
    Ok(())
}

fn update_with_forwarded<H: Heap + ?Sized>(heap: &H, slot: &RefSlot, obj: ObjRef) -> ObjRef {
    if !heap.in_collection_set(obj) {
        return obj;
    }
    let forwarded = heap.resolve_forwarded(obj);
    slot.store(forwarded, heap.encoding());
    forwarded
}

fn maybe_update_with_forwarded<H: Heap + ?Sized>(heap: &H, slot: &RefSlot, obj: ObjRef) -> ObjRef {
    if !heap.in_collection_set(obj) {
        return obj;
    }
    let forwarded = heap.resolve_forwarded(obj);
    if forwarded == obj {
        // Not evacuated yet.
        return obj;
    }
    match slot.compare_exchange(obj, forwarded, heap.encoding()) {
        Ok(_) => forwarded,
        Err(_) => ObjRef::NULL,
    }
}

/// Slot visitor applying [`mark_through_ref`] to every slot it sees.
pub struct MarkRefsClosure<'a, H: Heap + ?Sized, S: TaskSink + ?Sized> {
    heap: &'a H,
    queue: &'a S,
    mode: UpdateRefsMode,
    dedup: Option<DedupSink<'a>>,
}

impl<'a, H: Heap + ?Sized, S: TaskSink + ?Sized> MarkRefsClosure<'a, H, S> {
    /// Create a closure marking into `queue`.
    #[must_use]
    pub const fn new(
        heap: &'a H,
        queue: &'a S,
        mode: UpdateRefsMode,
        dedup: Option<DedupSink<'a>>,
    ) -> Self {
        Self {
            heap,
            queue,
            mode,
            dedup,
        }
    }

    /// The queue new tasks go to.
    #[must_use]
    pub const fn queue(&self) -> &'a S {
        self.queue
    }

    /// Resolution mode in use.
    #[must_use]
    pub const fn mode(&self) -> UpdateRefsMode {
        self.mode
    }
}

impl<H: Heap + ?Sized, S: TaskSink + ?Sized> SlotVisitor for MarkRefsClosure<'_, H, S> {
    #[inline]
    fn visit_slot(&mut self, slot: &RefSlot) -> MarkResult<()> {
        mark_through_ref(self.heap, slot, self.queue, self.mode, self.dedup.as_ref())
    }
}

/// Concurrent marking engine for one heap.
///
/// Owns the per-worker queues, live-data counters and dedup queues, the shared
/// overflow store and the snapshot buffer set. Marking itself runs through
/// [`mark_parallel`](Self::mark_parallel).
pub struct ConcurrentMark<H: Heap> {
    pub(crate) heap: Arc<H>,
    pub(crate) config: MarkConfig,
    pub(crate) splitter: ArraySplitter,
    pub(crate) overflow: Arc<OverflowStore>,
    pub(crate) queues: Box<[ObjToScanQueue]>,
    pub(crate) live_data: Box<[LiveData]>,
    pub(crate) dedup_queues: Box<[DedupQueue]>,
    pub(crate) satb: Arc<SatbQueueSet>,
    pub(crate) dedup: Option<Arc<dyn StringDedup>>,
    pub(crate) pacer: Option<Arc<Pacer<H>>>,
}

impl<H: Heap> ConcurrentMark<H> {
    /// Create a marking engine for `heap`.
    ///
    /// # Errors
    ///
    /// Returns [`MarkError::InvalidConfig`](crate::MarkError::InvalidConfig)
    /// when `config` does not validate.
    pub fn new(heap: Arc<H>, config: MarkConfig) -> MarkResult<Self> {
        config.validate()?;
        let overflow = Arc::new(OverflowStore::new(config.overflow));
        let queues = (0..config.workers)
            .map(|id| ObjToScanQueue::new(id, config.local_queue_capacity, Arc::clone(&overflow)))
            .collect();
        let regions = heap.region_count();
        let live_data = (0..config.workers)
            .map(|_| LiveData::new(regions, config.live_data_flush_threshold))
            .collect();
        let dedup_queues = (0..config.workers).map(|_| DedupQueue::new()).collect();
        let satb = Arc::new(SatbQueueSet::new(
            crate::mark::satb::DEFAULT_SATB_BUFFER_SIZE,
            heap.encoding(),
        ));
        Ok(Self {
            heap,
            splitter: ArraySplitter::new(config.stride),
            config,
            overflow,
            queues,
            live_data,
            dedup_queues,
            satb,
            dedup: None,
            pacer: None,
        })
    }

    /// Attach a string deduplication policy. Used only when
    /// [`MarkConfig::dedup`] is set.
    #[must_use]
    pub fn with_string_dedup(mut self, dedup: Arc<dyn StringDedup>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Report marking progress to `pacer`.
    #[must_use]
    pub fn with_pacer(mut self, pacer: Arc<Pacer<H>>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// The heap being marked.
    #[must_use]
    pub fn heap(&self) -> &Arc<H> {
        &self.heap
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &MarkConfig {
        &self.config
    }

    /// The array splitter.
    #[must_use]
    pub const fn splitter(&self) -> &ArraySplitter {
        &self.splitter
    }

    /// Worker queues, indexed by worker.
    #[must_use]
    pub fn queues(&self) -> &[ObjToScanQueue] {
        &self.queues
    }

    /// The snapshot buffer set mutators log into.
    #[must_use]
    pub fn satb_queue_set(&self) -> &Arc<SatbQueueSet> {
        &self.satb
    }

    /// Prepare for a new cycle: zero live-data counters and activate the
    /// snapshot barrier.
    pub fn mark_start(&mut self) {
        for live in self.live_data.iter_mut() {
            live.reset();
        }
        self.satb.set_active(true);
    }

    /// Mark the referents of `roots`, distributing them round-robin over the
    /// worker queues.
    ///
    /// # Errors
    ///
    /// Propagates queue exhaustion.
    pub fn mark_roots(&mut self, roots: &[RefSlot], mode: UpdateRefsMode) -> MarkResult<()> {
        let workers = self.queues.len();
        for (i, slot) in roots.iter().enumerate() {
            let w = i % workers;
            let sink = self.dedup_sink(w);
            mark_through_ref(&*self.heap, slot, &self.queues[w], mode, sink.as_ref())?;
        }
        Ok(())
    }

    /// Drop all queued work and snapshot buffers after a cancelled cycle.
    pub fn abandon(&mut self) {
        for queue in self.queues.iter() {
            while queue.pop_buffer().is_some() || queue.pop_local().is_some() {}
        }
        while self.overflow.pop().is_some() {}
        self.satb.abandon_partial_marking();
    }

    /// Whether any queue or the snapshot buffer set still holds work.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        !self.overflow.is_empty()
            || self.satb.completed_buffers() > 0
            || self.queues.iter().any(|q| !q.is_empty())
    }

    /// Take every dedup candidate found so far.
    pub fn take_dedup_candidates(&self) -> Vec<ObjRef> {
        self.dedup_queues.iter().flat_map(DedupQueue::drain).collect()
    }

    pub(crate) fn dedup_sink(&self, worker: usize) -> Option<DedupSink<'_>> {
        if !self.config.dedup {
            return None;
        }
        let dedup = self.dedup.as_deref()?;
        dedup
            .is_enabled()
            .then(|| DedupSink::new(dedup, &self.dedup_queues[worker]))
    }

    /// Process one task to completion.
    ///
    /// Returns the words scanned by this task, used as pacer progress. Over
    /// all tasks of one object this sums to the object's size.
    ///
    /// # Errors
    ///
    /// Propagates queue exhaustion while pushing follow-up tasks.
    pub fn do_task<S: TaskSink + ?Sized>(
        &self,
        cl: &mut MarkRefsClosure<'_, H, S>,
        live: &mut LiveData,
        task: MarkTask,
    ) -> MarkResult<usize> {
        let heap = &*self.heap;
        let obj = task.obj();

        asserts::assert_not_forwarded(heap, obj);
        asserts::assert_marked(heap, obj);
        asserts::assert_not_in_cset_except(heap, obj, heap.cancelled_gc());

        match task.kind() {
            TaskKind::Object(obj) => {
                live.count_liveness(heap, obj);
                let size = heap.object_size_words(obj);
                match heap.object_kind(obj) {
                    ObjectKind::Instance => {
                        heap.iterate_object(obj, cl)?;
                        Ok(size)
                    }
                    // Not split yet: this is the first visit. Pushed chunks
                    // report their own elements.
                    ObjectKind::ObjArray => {
                        let header = size.saturating_sub(heap.array_length(obj));
                        Ok(header + self.do_chunked_array_start(cl, obj)?)
                    }
                    // Primitive arrays hold no references.
                    ObjectKind::TypeArray => Ok(size),
                }
            }
            TaskKind::ArrayChunk { array, chunk, pow } => {
                self.do_chunked_array(cl, array, chunk, pow)
            }
        }
    }

    fn do_chunked_array_start<S: TaskSink + ?Sized>(
        &self,
        cl: &mut MarkRefsClosure<'_, H, S>,
        array: ObjRef,
    ) -> MarkResult<usize> {
        let heap = &*self.heap;
        let len = heap.array_length(array);
        let queue = cl.queue();
        let mut scanned = 0;
        self.splitter.start(queue, array, len, |range| {
            scanned += range.len();
            heap.iterate_array_range(array, range.start, range.end, cl)
        })?;
        Ok(scanned)
    }

    fn do_chunked_array<S: TaskSink + ?Sized>(
        &self,
        cl: &mut MarkRefsClosure<'_, H, S>,
        array: ObjRef,
        chunk: usize,
        pow: u32,
    ) -> MarkResult<usize> {
        let heap = &*self.heap;
        debug_assert_eq!(
            chunk_range(chunk, pow).len(),
            1 << pow,
            "chunk width must match pow"
        );
        let queue = cl.queue();
        let mut scanned = 0;
        self.splitter.continue_chunk(queue, array, chunk, pow, |range| {
            asserts::assert_chunk_in_bounds(heap, array, &range);
            scanned += range.len();
            heap.iterate_array_range(array, range.start, range.end, cl)
        })?;
        Ok(scanned)
    }
}

impl<H: Heap> std::fmt::Debug for ConcurrentMark<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMark")
            .field("config", &self.config)
            .field("overflow", &self.overflow.len())
            .field("satb_buffers", &self.satb.completed_buffers())
            .field("pacer", &self.pacer.is_some())
            .finish_non_exhaustive()
    }
}
