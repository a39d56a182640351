//! Mark bitmap and the claim-once marking contract.
//!
//! One bit per heap word. An object is marked by setting the bit of its first
//! word; the atomic `fetch_or` is what makes exactly one marker win the race
//! for any object.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::heap::HEAP_WORD_SIZE;
use crate::oop::ObjRef;

/// Marking state for one cycle.
pub trait MarkingContext: Send + Sync {
    /// Try to mark `obj`. Returns `true` for exactly one caller per object
    /// across all threads; every other caller sees `false`.
    fn mark(&self, obj: ObjRef) -> bool;

    /// Whether `obj` has been marked.
    fn is_marked(&self, obj: ObjRef) -> bool;
}

/// A heap-range bitmap recording object liveness.
///
/// # Example
///
/// ```
/// use tidemark::{MarkBitmap, MarkingContext, ObjRef};
///
/// let bitmap = MarkBitmap::new(0x10_0000, 4096);
/// let obj = ObjRef::from_addr(0x10_0040);
/// assert!(!bitmap.is_marked(obj));
///
/// assert!(bitmap.mark(obj));
/// assert!(!bitmap.mark(obj));
/// assert!(bitmap.is_marked(obj));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    /// First covered address.
    base: usize,
    /// Covered heap words.
    size_words: usize,
    /// One bit per heap word.
    bitmap: Vec<AtomicU64>,
    /// Number of marked objects (atomic for parallel access).
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Create a bitmap covering `size_words` heap words from `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not word aligned.
    #[must_use]
    pub fn new(base: usize, size_words: usize) -> Self {
        assert!(
            base % HEAP_WORD_SIZE == 0,
            "MarkBitmap base must be word aligned"
        );
        let words = size_words.div_ceil(64);
        let mut bitmap = Vec::with_capacity(words);
        for _ in 0..words {
            bitmap.push(AtomicU64::new(0));
        }
        Self {
            base,
            size_words,
            bitmap,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Whether `obj` lies in the covered range.
    #[must_use]
    pub const fn covers(&self, obj: ObjRef) -> bool {
        let addr = obj.addr();
        addr >= self.base && (addr - self.base) / HEAP_WORD_SIZE < self.size_words
    }

    /// Number of objects marked since the last clear.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Clear all marks for the next cycle.
    pub fn clear(&self) {
        for word in &self.bitmap {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }

    fn bit_of(&self, obj: ObjRef) -> (usize, u64) {
        assert!(self.covers(obj), "{obj:?} is outside the mark bitmap");
        let index = (obj.addr() - self.base) / HEAP_WORD_SIZE;
        (index / 64, 1u64 << (index % 64))
    }
}

impl MarkingContext for MarkBitmap {
    fn mark(&self, obj: ObjRef) -> bool {
        let (word, mask) = self.bit_of(obj);
        let prev = self.bitmap[word].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn is_marked(&self, obj: ObjRef) -> bool {
        let (word, mask) = self.bit_of(obj);
        self.bitmap[word].load(Ordering::Acquire) & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::{MarkBitmap, MarkingContext};
    use crate::oop::ObjRef;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const BASE: usize = 0x4000_0000;

    fn obj(word: usize) -> ObjRef {
        ObjRef::from_addr(BASE + word * 8)
    }

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let bitmap = Arc::new(MarkBitmap::new(BASE, 512));
        let mut handles = Vec::new();

        for i in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            let handle = thread::spawn(move || {
                for j in 0..128 {
                    assert!(bitmap.mark(obj(i * 128 + j)));
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bitmap.marked_count(), 512);
    }

    #[test]
    fn test_mark_bitmap_single_winner() {
        let bitmap = Arc::new(MarkBitmap::new(BASE, 64));
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if bitmap.mark(obj(17)) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert_eq!(bitmap.marked_count(), 1);
    }

    #[test]
    fn test_mark_bitmap_mark_is_marked() {
        let bitmap = MarkBitmap::new(BASE, 512);

        assert!(!bitmap.is_marked(obj(0)));
        assert!(!bitmap.is_marked(obj(63)));

        bitmap.mark(obj(0));
        bitmap.mark(obj(63));

        assert!(bitmap.is_marked(obj(0)));
        assert!(bitmap.is_marked(obj(63)));
        assert!(!bitmap.is_marked(obj(1)));
    }

    #[test]
    fn test_mark_bitmap_clear() {
        let bitmap = MarkBitmap::new(BASE, 512);

        bitmap.mark(obj(0));
        bitmap.mark(obj(100));
        assert_eq!(bitmap.marked_count(), 2);

        bitmap.clear();
        assert_eq!(bitmap.marked_count(), 0);
        assert!(!bitmap.is_marked(obj(0)));
    }

    #[test]
    fn test_mark_bitmap_covers() {
        let bitmap = MarkBitmap::new(BASE, 100);
        assert!(bitmap.covers(obj(0)));
        assert!(bitmap.covers(obj(99)));
        assert!(!bitmap.covers(obj(100)));
        assert!(!bitmap.covers(ObjRef::from_addr(BASE - 8)));
    }
}
