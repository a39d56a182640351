//! An in-memory heap for tests and benchmarks.
//!
//! [`TestHeap`] lays objects out in fixed-size regions starting at
//! [`HEAP_BASE`], supports humongous objects, evacuation with forwarding, a
//! collection set and cancellation, and records live data per region. Object
//! contents live in side tables: an address is only a key, never dereferenced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::MarkResult;
use crate::heap::{Heap, ObjectKind, RegionKind, SlotVisitor, HEAP_WORD_SIZE};
use crate::mark::bitmap::{MarkBitmap, MarkingContext};
use crate::oop::{ObjRef, RefEncoding, RefSlot};

/// Address of the first heap word.
pub const HEAP_BASE: usize = 0x1000_0000;

/// Header words of every object.
pub const HEADER_WORDS: usize = 2;

type ResolveHook = Box<dyn Fn(ObjRef) + Send + Sync>;

struct TestObject {
    kind: ObjectKind,
    size_words: usize,
    length: usize,
    slots: Box<[RefSlot]>,
}

#[derive(Clone, Copy)]
struct Region {
    kind: RegionKind,
    used_words: usize,
    in_cset: bool,
}

/// A region-based heap backed by side tables.
pub struct TestHeap {
    region_size_words: usize,
    regions: Vec<Region>,
    live: Box<[AtomicUsize]>,
    objects: HashMap<usize, TestObject>,
    order: Vec<ObjRef>,
    forwardings: HashMap<usize, ObjRef>,
    bump: usize,
    encoding: RefEncoding,
    overhead_words: usize,
    marks: MarkBitmap,
    cancelled: AtomicBool,
    resolve_hook: Option<ResolveHook>,
}

impl TestHeap {
    /// A heap of `regions` regions of `region_size_words` words each.
    #[must_use]
    pub fn new(regions: usize, region_size_words: usize) -> Self {
        assert!(regions > 0 && region_size_words > 0);
        Self {
            region_size_words,
            regions: vec![
                Region {
                    kind: RegionKind::Regular,
                    used_words: 0,
                    in_cset: false,
                };
                regions
            ],
            live: (0..regions).map(|_| AtomicUsize::new(0)).collect(),
            objects: HashMap::new(),
            order: Vec::new(),
            forwardings: HashMap::new(),
            bump: 0,
            encoding: RefEncoding::Wide,
            overhead_words: 0,
            marks: MarkBitmap::new(HEAP_BASE, regions * region_size_words),
            cancelled: AtomicBool::new(false),
            resolve_hook: None,
        }
    }

    /// Store references compressed against [`HEAP_BASE`].
    #[must_use]
    pub fn with_compressed_refs(mut self) -> Self {
        assert!(self.objects.is_empty(), "switch encoding before allocating");
        self.encoding = RefEncoding::Compressed {
            base: HEAP_BASE - HEAP_WORD_SIZE,
            shift: HEAP_WORD_SIZE.trailing_zeros(),
        };
        self
    }

    /// Reserve `words` of collector overhead in front of every object.
    #[must_use]
    pub fn with_overhead_words(mut self, words: usize) -> Self {
        assert!(self.objects.is_empty(), "set overhead before allocating");
        self.overhead_words = words;
        self
    }

    // ---- allocation ----

    /// Allocate an instance with `fields` reference fields, all null.
    pub fn alloc_instance(&mut self, fields: usize) -> ObjRef {
        self.alloc(ObjectKind::Instance, HEADER_WORDS + fields, 0, fields)
    }

    /// Allocate an object array of `len` null elements.
    pub fn alloc_obj_array(&mut self, len: usize) -> ObjRef {
        self.alloc(ObjectKind::ObjArray, HEADER_WORDS + 1 + len, len, len)
    }

    /// Allocate a primitive array of `len` words.
    pub fn alloc_type_array(&mut self, len: usize) -> ObjRef {
        self.alloc(ObjectKind::TypeArray, HEADER_WORDS + 1 + len, len, 0)
    }

    fn region_base(&self, region: usize) -> usize {
        HEAP_BASE + region * self.region_size_words * HEAP_WORD_SIZE
    }

    fn alloc(&mut self, kind: ObjectKind, size_words: usize, length: usize, slots: usize) -> ObjRef {
        let total = size_words + self.overhead_words;
        let addr = if total > self.region_size_words {
            self.alloc_humongous(total)
        } else {
            if !self.bump_fits(total) {
                self.bump += 1;
            }
            assert!(self.bump_fits(total), "test heap is full");
            let region = &mut self.regions[self.bump];
            let offset = region.used_words + self.overhead_words;
            region.used_words += total;
            self.region_base(self.bump) + offset * HEAP_WORD_SIZE
        };

        let obj = ObjRef::from_addr(addr);
        self.objects.insert(
            addr,
            TestObject {
                kind,
                size_words,
                length,
                slots: (0..slots).map(|_| RefSlot::null()).collect(),
            },
        );
        self.order.push(obj);
        obj
    }

    fn bump_fits(&self, words: usize) -> bool {
        self.regions.get(self.bump).is_some_and(|r| {
            !r.in_cset && r.kind == RegionKind::Regular && r.used_words + words <= self.region_size_words
        })
    }

    fn alloc_humongous(&mut self, total: usize) -> usize {
        let start = match self.regions.get(self.bump) {
            Some(r) if r.used_words > 0 || r.in_cset => self.bump + 1,
            _ => self.bump,
        };
        let count = total.div_ceil(self.region_size_words);
        assert!(start + count <= self.regions.len(), "test heap is full");

        let mut left = total;
        for (i, region) in self.regions[start..start + count].iter_mut().enumerate() {
            region.kind = if i == 0 {
                RegionKind::HumongousStart
            } else {
                RegionKind::HumongousContinuation
            };
            region.used_words = left.min(self.region_size_words);
            left -= region.used_words;
        }
        // Regular allocation resumes past the chain.
        self.bump = start + count;
        self.region_base(start) + self.overhead_words * HEAP_WORD_SIZE
    }

    /// Copy `obj` out of its region, which joins the collection set, and
    /// forward it to the copy.
    pub fn evacuate(&mut self, obj: ObjRef) -> ObjRef {
        let from = self.region_index_containing(obj);
        self.regions[from].in_cset = true;

        let (kind, size_words, length, slots) = {
            let o = self.object(obj);
            (o.kind, o.size_words, o.length, o.slots.len())
        };
        let copy = self.alloc(kind, size_words, length, slots);
        for (dst, src) in self.object(copy).slots.iter().zip(self.object(obj).slots.iter()) {
            dst.store(src.load(self.encoding), self.encoding);
        }
        debug_assert!(!self.regions[self.region_index_containing(copy)].in_cset);
        self.forwardings.insert(obj.addr(), copy);
        copy
    }

    /// Run `hook` whenever a forwarded reference is resolved.
    pub fn set_resolve_hook(&mut self, hook: impl Fn(ObjRef) + Send + Sync + 'static) {
        self.resolve_hook = Some(Box::new(hook));
    }

    // ---- mutation ----

    fn object(&self, obj: ObjRef) -> &TestObject {
        match self.objects.get(&obj.addr()) {
            Some(o) => o,
            None => panic!("{obj:?} is not an object of this heap"),
        }
    }

    /// Store `target` into field `index` of `obj`.
    pub fn set_field(&self, obj: ObjRef, index: usize, target: ObjRef) {
        self.object(obj).slots[index].store(target, self.encoding);
    }

    /// Store `target` into element `index` of `array`.
    pub fn set_element(&self, array: ObjRef, index: usize, target: ObjRef) {
        self.set_field(array, index, target);
    }

    /// Read field `index` of `obj`.
    #[must_use]
    pub fn field(&self, obj: ObjRef, index: usize) -> ObjRef {
        self.object(obj).slots[index].load(self.encoding)
    }

    /// A root slot referring to `obj`.
    #[must_use]
    pub fn root(&self, obj: ObjRef) -> RefSlot {
        RefSlot::new(obj, self.encoding)
    }

    /// Request cancellation of the current cycle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clear marks, live data and the cancellation flag for a new cycle.
    pub fn reset_cycle(&self) {
        self.marks.clear();
        for live in self.live.iter() {
            live.store(0, Ordering::Relaxed);
        }
        self.cancelled.store(false, Ordering::Release);
    }

    // ---- inspection ----

    /// Mark `obj` directly.
    pub fn mark(&self, obj: ObjRef) -> bool {
        self.marks.mark(obj)
    }

    /// Whether `obj` is marked.
    #[must_use]
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.marks.is_marked(obj)
    }

    /// Shared live-data counter of region `index`.
    #[must_use]
    pub fn live_data_words(&self, index: usize) -> usize {
        self.live[index].load(Ordering::Acquire)
    }

    /// Every object in allocation order, evacuation copies included.
    #[must_use]
    pub fn objects(&self) -> &[ObjRef] {
        &self.order
    }

    /// Objects reachable from `roots`, following forwarding.
    #[must_use]
    pub fn reachable(&self, roots: &[ObjRef]) -> HashSet<ObjRef> {
        let mut seen = HashSet::new();
        let mut work: VecDeque<ObjRef> = roots
            .iter()
            .filter(|r| !r.is_null())
            .map(|&r| self.forwardee(r))
            .collect();
        while let Some(obj) = work.pop_front() {
            if !seen.insert(obj) {
                continue;
            }
            for slot in self.object(obj).slots.iter() {
                let next = slot.load(self.encoding);
                if !next.is_null() {
                    work.push_back(self.forwardee(next));
                }
            }
        }
        seen
    }

    /// Expected per-region live words when exactly `live` objects survive.
    #[must_use]
    pub fn expected_live_words<'a>(&self, live: impl IntoIterator<Item = &'a ObjRef>) -> Vec<usize> {
        let mut words = vec![0; self.regions.len()];
        for &obj in live {
            let region = self.region_index_containing(obj);
            if self.regions[region].kind == RegionKind::HumongousStart {
                for r in self.humongous_regions(obj) {
                    words[r] += self.regions[r].used_words;
                }
            } else {
                words[region] += self.object_size_words(obj) + self.overhead_words;
            }
        }
        words
    }

    fn forwardee(&self, obj: ObjRef) -> ObjRef {
        self.forwardings.get(&obj.addr()).copied().unwrap_or(obj)
    }
}

impl std::fmt::Debug for TestHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHeap")
            .field("regions", &self.regions.len())
            .field("region_size_words", &self.region_size_words)
            .field("objects", &self.order.len())
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl Heap for TestHeap {
    type Marks = MarkBitmap;

    fn encoding(&self) -> RefEncoding {
        self.encoding
    }

    fn object_kind(&self, obj: ObjRef) -> ObjectKind {
        self.object(obj).kind
    }

    fn object_size_words(&self, obj: ObjRef) -> usize {
        self.object(obj).size_words
    }

    fn array_length(&self, array: ObjRef) -> usize {
        self.object(array).length
    }

    fn iterate_object(&self, obj: ObjRef, visitor: &mut dyn SlotVisitor) -> MarkResult<()> {
        for slot in self.object(obj).slots.iter() {
            visitor.visit_slot(slot)?;
        }
        Ok(())
    }

    fn iterate_array_range(
        &self,
        array: ObjRef,
        from: usize,
        to: usize,
        visitor: &mut dyn SlotVisitor,
    ) -> MarkResult<()> {
        for slot in &self.object(array).slots[from..to] {
            visitor.visit_slot(slot)?;
        }
        Ok(())
    }

    fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_size_words(&self) -> usize {
        self.region_size_words
    }

    fn region_index_containing(&self, obj: ObjRef) -> usize {
        (obj.addr() - HEAP_BASE) / HEAP_WORD_SIZE / self.region_size_words
    }

    fn region_kind(&self, index: usize) -> RegionKind {
        self.regions[index].kind
    }

    fn region_used_words(&self, index: usize) -> usize {
        self.regions[index].used_words
    }

    fn increase_live_data_words(&self, index: usize, words: usize) {
        self.live[index].fetch_add(words, Ordering::AcqRel);
    }

    fn per_object_overhead_words(&self) -> usize {
        self.overhead_words
    }

    fn has_forwarded_objects(&self) -> bool {
        !self.forwardings.is_empty()
    }

    fn is_forwarded(&self, obj: ObjRef) -> bool {
        self.forwardings.contains_key(&obj.addr())
    }

    fn resolve_forwarded(&self, obj: ObjRef) -> ObjRef {
        if let Some(hook) = &self.resolve_hook {
            hook(obj);
        }
        self.forwardee(obj)
    }

    fn in_collection_set(&self, obj: ObjRef) -> bool {
        self.regions[self.region_index_containing(obj)].in_cset
    }

    fn cancelled_gc(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn marking_context(&self) -> &MarkBitmap {
        &self.marks
    }

    fn max_capacity_bytes(&self) -> usize {
        self.regions.len() * self.region_size_words * HEAP_WORD_SIZE
    }

    fn free_bytes(&self) -> usize {
        self.max_capacity_bytes() - self.used_bytes()
    }

    fn used_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.used_words).sum::<usize>() * HEAP_WORD_SIZE
    }

    fn collection_set_used_bytes(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.in_cset)
            .map(|r| r.used_words)
            .sum::<usize>()
            * HEAP_WORD_SIZE
    }
}
