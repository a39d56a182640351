//! Fail-fast invariant checks for marking.
//!
//! These guard preconditions whose violation means a bug in the collector,
//! not a runtime condition. They panic with a diagnostic in debug builds and
//! compile to nothing in release builds.

use std::ops::Range;

use crate::heap::{Heap, ObjectKind};
use crate::mark::bitmap::MarkingContext;
use crate::oop::ObjRef;

/// `obj` must not have been relocated.
#[inline]
#[track_caller]
pub fn assert_not_forwarded<H: Heap + ?Sized>(heap: &H, obj: ObjRef) {
    debug_assert!(
        !heap.is_forwarded(obj),
        "{obj:?} is forwarded to {:?}",
        heap.resolve_forwarded(obj)
    );
}

/// `obj` must be marked in the current marking context.
#[inline]
#[track_caller]
pub fn assert_marked<H: Heap + ?Sized>(heap: &H, obj: ObjRef) {
    debug_assert!(
        heap.marking_context().is_marked(obj),
        "{obj:?} is not marked"
    );
}

/// `obj` must lie outside the collection set, unless `exception` holds.
#[inline]
#[track_caller]
pub fn assert_not_in_cset_except<H: Heap + ?Sized>(heap: &H, obj: ObjRef, exception: bool) {
    debug_assert!(
        exception || !heap.in_collection_set(obj),
        "{obj:?} is in the collection set"
    );
}

/// A chunk scanned by continuation must lie inside its array.
#[inline]
#[track_caller]
pub fn assert_chunk_in_bounds<H: Heap + ?Sized>(heap: &H, array: ObjRef, range: &Range<usize>) {
    if cfg!(debug_assertions) {
        debug_assert_eq!(heap.object_kind(array), ObjectKind::ObjArray);
        let len = heap.array_length(array);
        debug_assert!(range.start < len, "chunk start {} beyond {len}", range.start);
        debug_assert!(
            range.end > 0 && range.end <= len,
            "chunk end {} beyond {len}",
            range.end
        );
    }
}
