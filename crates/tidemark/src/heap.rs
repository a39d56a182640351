//! The heap as seen by the marking engine and the pacer.
//!
//! Region tables, forwarding and the object layout belong to the embedding
//! collector. Everything the marker needs from them goes through the [`Heap`]
//! trait, and a handle to it is passed explicitly to [`ConcurrentMark`] and
//! [`Pacer`].
//!
//! [`ConcurrentMark`]: crate::ConcurrentMark
//! [`Pacer`]: crate::Pacer

use std::ops::Range;

use crate::error::MarkResult;
use crate::mark::bitmap::MarkingContext;
use crate::oop::{ObjRef, RefEncoding, RefSlot};

/// Size of a heap word in bytes.
pub const HEAP_WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Layout class of an object, as far as reference scanning cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// An ordinary object with reference fields.
    Instance,
    /// An array whose elements are references.
    ObjArray,
    /// An array of primitives. Holds no references.
    TypeArray,
}

/// Role of a heap region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Holds ordinary objects.
    Regular,
    /// First region of a humongous object.
    HumongousStart,
    /// Trailing region of a humongous object.
    HumongousContinuation,
}

impl RegionKind {
    /// Whether the region is part of a humongous chain.
    #[must_use]
    pub const fn is_humongous(self) -> bool {
        matches!(self, Self::HumongousStart | Self::HumongousContinuation)
    }
}

/// Receives every reference slot of a scanned object or array range.
pub trait SlotVisitor {
    /// Process one slot.
    ///
    /// # Errors
    ///
    /// Propagates queue exhaustion from marking through the slot.
    fn visit_slot(&mut self, slot: &RefSlot) -> MarkResult<()>;
}

/// Heap services consumed by marking and pacing.
///
/// Implementations must be safe to call from all marking workers and
/// allocating threads at once.
pub trait Heap: Send + Sync {
    /// Mark state for the cycle in progress.
    type Marks: MarkingContext;

    // ---- object model ----

    /// How reference slots are encoded.
    fn encoding(&self) -> RefEncoding {
        RefEncoding::Wide
    }

    /// Layout class of `obj`.
    fn object_kind(&self, obj: ObjRef) -> ObjectKind;

    /// Size of `obj` in heap words, excluding collector overhead.
    fn object_size_words(&self, obj: ObjRef) -> usize;

    /// Element count of an array object.
    fn array_length(&self, array: ObjRef) -> usize;

    /// Visit every reference field of `obj`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `visitor`.
    fn iterate_object(&self, obj: ObjRef, visitor: &mut dyn SlotVisitor) -> MarkResult<()>;

    /// Visit reference elements `from..to` of an object array.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `visitor`.
    fn iterate_array_range(
        &self,
        array: ObjRef,
        from: usize,
        to: usize,
        visitor: &mut dyn SlotVisitor,
    ) -> MarkResult<()>;

    // ---- regions ----

    /// Number of regions in the heap.
    fn region_count(&self) -> usize;

    /// Region size in heap words.
    fn region_size_words(&self) -> usize;

    /// Index of the region `obj` starts in.
    fn region_index_containing(&self, obj: ObjRef) -> usize;

    /// Role of region `index`.
    fn region_kind(&self, index: usize) -> RegionKind;

    /// Words allocated in region `index`.
    fn region_used_words(&self, index: usize) -> usize;

    /// Atomically add to the shared live-data counter of region `index`.
    fn increase_live_data_words(&self, index: usize, words: usize);

    /// Fixed collector overhead accounted to every live object, in words.
    fn per_object_overhead_words(&self) -> usize {
        0
    }

    /// Regions spanned by the humongous object starting at `obj`.
    fn humongous_regions(&self, obj: ObjRef) -> Range<usize> {
        let start = self.region_index_containing(obj);
        let words = self.object_size_words(obj) + self.per_object_overhead_words();
        start..start + words.div_ceil(self.region_size_words())
    }

    // ---- relocation ----

    /// Whether any object in the heap may currently be forwarded.
    fn has_forwarded_objects(&self) -> bool;

    /// Whether `obj` has been relocated and has a forwarding link.
    fn is_forwarded(&self, obj: ObjRef) -> bool;

    /// Current location of `obj`; `obj` itself when not forwarded.
    fn resolve_forwarded(&self, obj: ObjRef) -> ObjRef;

    /// Whether `obj` lies in the active collection set.
    fn in_collection_set(&self, obj: ObjRef) -> bool;

    // ---- cycle state ----

    /// Whether the current cycle has been cancelled.
    fn cancelled_gc(&self) -> bool;

    /// The marking context in use for this cycle.
    fn marking_context(&self) -> &Self::Marks;

    // ---- capacity, for pacing ----

    /// Maximum heap capacity in bytes.
    fn max_capacity_bytes(&self) -> usize;

    /// Bytes immediately available for allocation.
    fn free_bytes(&self) -> usize;

    /// Bytes in use.
    fn used_bytes(&self) -> usize;

    /// Bytes in use within the collection set.
    fn collection_set_used_bytes(&self) -> usize;
}
