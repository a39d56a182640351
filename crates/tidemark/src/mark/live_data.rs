//! Per-worker live-data accounting.
//!
//! Every marked object adds its size to the live-data counter of the region it
//! starts in. Hitting the shared atomic counter for each object would make
//! regions full of small objects a contention hotspot, so each worker batches
//! increments in private counters and only flushes a counter to the region
//! when it would reach the flush threshold.
//!
//! Humongous objects bypass batching and credit every region of their chain
//! directly. They are rare, and their size alone may dwarf the threshold.

use crate::heap::{Heap, RegionKind};
use crate::oop::ObjRef;

/// One worker's batched live-data counters, one per region.
#[derive(Debug)]
pub struct LiveData {
    counters: Box<[u32]>,
    threshold: u32,
}

impl LiveData {
    /// Counters for `regions` regions, flushed at `threshold` words.
    #[must_use]
    pub fn new(regions: usize, threshold: u32) -> Self {
        debug_assert!(threshold > 0, "live data threshold must be non-zero");
        Self {
            counters: vec![0; regions].into_boxed_slice(),
            threshold,
        }
    }

    /// Zero every counter. Called at mark start.
    pub fn reset(&mut self) {
        self.counters.fill(0);
    }

    /// Words batched locally for `region`, not yet flushed.
    #[must_use]
    pub fn pending(&self, region: usize) -> u32 {
        self.counters[region]
    }

    /// Account a newly scanned object.
    pub fn count_liveness<H: Heap + ?Sized>(&mut self, heap: &H, obj: ObjRef) {
        let region = heap.region_index_containing(obj);
        match heap.region_kind(region) {
            RegionKind::HumongousStart => Self::count_liveness_humongous(heap, obj),
            kind => {
                debug_assert!(!kind.is_humongous(), "cannot have continuations here");
                let words = heap.object_size_words(obj) + heap.per_object_overhead_words();
                self.record(heap, region, words);
            }
        }
    }

    /// Add `words` to `region`, flushing to the heap when the local counter
    /// would reach the threshold.
    pub fn record<H: Heap + ?Sized>(&mut self, heap: &H, region: usize, words: usize) {
        let max = self.threshold as usize;
        if words >= max {
            // Too big to batch, add to the region directly.
            heap.increase_live_data_words(region, words);
            return;
        }

        let cur = self.counters[region] as usize;
        if cur + words >= max {
            heap.increase_live_data_words(region, cur);
            self.counters[region] = Self::narrow(words);
        } else {
            self.counters[region] = Self::narrow(cur + words);
        }
    }

    /// Push every non-zero counter to its region and zero it.
    pub fn flush<H: Heap + ?Sized>(&mut self, heap: &H) {
        for (region, counter) in self.counters.iter_mut().enumerate() {
            if *counter > 0 {
                heap.increase_live_data_words(region, *counter as usize);
                *counter = 0;
            }
        }
    }

    fn count_liveness_humongous<H: Heap + ?Sized>(heap: &H, obj: ObjRef) {
        for region in heap.humongous_regions(obj) {
            debug_assert!(
                heap.region_kind(region).is_humongous(),
                "expecting a humongous region at {region}"
            );
            heap.increase_live_data_words(region, heap.region_used_words(region));
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn narrow(words: usize) -> u32 {
        // Callers keep `words` below the threshold, which is a u32.
        words as u32
    }
}
