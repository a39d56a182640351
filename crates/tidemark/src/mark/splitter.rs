//! Chunked scanning of large object arrays.
//!
//! A large array is conceptually covered by a complete binary subdivision of
//! `2^bits >= length` elements. The start routine walks down that tree,
//! pushing every left half that starts inside the array as a chunk task and
//! following the right half, until chunks shrink to the stride or chunk ids run
//! out. Whatever it did not push is the irregular tail, scanned in place.
//!
//! Only chunks that lie entirely inside the array are ever pushed, so the
//! continuation routine never has to read the array length again: it keeps
//! halving its chunk, pushing left halves, and scans what remains.

use std::ops::Range;

use crate::error::MarkResult;
use crate::mark::queue::ObjToScanQueue;
use crate::mark::task::{chunk_range, MarkTask};
use crate::oop::ObjRef;

/// Destination for tasks produced while splitting.
pub trait TaskSink {
    /// Queue a task for later processing.
    ///
    /// # Errors
    ///
    /// Returns an error when the task cannot be stored.
    fn push_task(&self, task: MarkTask) -> MarkResult<()>;
}

impl TaskSink for ObjToScanQueue {
    fn push_task(&self, task: MarkTask) -> MarkResult<()> {
        self.push(task)
    }
}

/// Splitting policy for object arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArraySplitter {
    stride: usize,
}

impl ArraySplitter {
    /// Create a splitter whose chunks are never narrower than `stride`.
    #[must_use]
    pub const fn new(stride: usize) -> Self {
        assert!(stride > 0, "array stride must be non-zero");
        Self { stride }
    }

    /// Minimum chunk width.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Begin scanning an array of `len` elements that has not been split yet.
    ///
    /// Pushes full-width chunk tasks to `sink` and calls `scan` for the
    /// irregular tail (or for the whole array when it is short).
    ///
    /// # Errors
    ///
    /// Propagates errors from `sink` and `scan`.
    pub fn start<S, F>(&self, sink: &S, array: ObjRef, len: usize, mut scan: F) -> MarkResult<()>
    where
        S: TaskSink + ?Sized,
        F: FnMut(Range<usize>) -> MarkResult<()>,
    {
        if len <= self.stride * 2 {
            // A few slices only, scan directly.
            return scan(0..len);
        }
        debug_assert!(
            len <= MarkTask::MAX_ARRAY_LENGTH,
            "array of {len} elements is too long to chunk"
        );

        // Cover the array in excess when the length is not a power of two.
        let mut pow = len.next_power_of_two().trailing_zeros();
        let mut chunk = 1;
        let mut last_idx = 0;

        if pow >= MarkTask::POW_LIMIT {
            debug_assert_eq!(pow, MarkTask::POW_LIMIT, "chunk pow overflow");
            pow -= 1;
            chunk = 2;
            last_idx = 1 << pow;
            sink.push_task(MarkTask::chunk(array, 1, pow))?;
        }

        // Record the last pushed right boundary to find the irregular tail.
        while (1usize << pow) > self.stride && chunk * 2 < MarkTask::CHUNK_SIZE {
            pow -= 1;
            let left_chunk = chunk * 2 - 1;
            let right_chunk = chunk * 2;
            let left_chunk_end = left_chunk << pow;
            if left_chunk_end < len {
                sink.push_task(MarkTask::chunk(array, left_chunk, pow))?;
                chunk = right_chunk;
                last_idx = left_chunk_end;
            } else {
                chunk = left_chunk;
            }
        }

        if last_idx < len {
            scan(last_idx..len)?;
        }
        Ok(())
    }

    /// Continue scanning chunk `chunk` at exponent `pow` taken off a queue.
    ///
    /// # Errors
    ///
    /// Propagates errors from `sink` and `scan`.
    pub fn continue_chunk<S, F>(
        &self,
        sink: &S,
        array: ObjRef,
        mut chunk: usize,
        mut pow: u32,
        mut scan: F,
    ) -> MarkResult<()>
    where
        S: TaskSink + ?Sized,
        F: FnMut(Range<usize>) -> MarkResult<()>,
    {
        // Left halves are pushed; the right half is kept. Both are in bounds
        // because the parent was.
        while (1usize << pow) > self.stride && chunk * 2 < MarkTask::CHUNK_SIZE {
            pow -= 1;
            chunk *= 2;
            sink.push_task(MarkTask::chunk(array, chunk - 1, pow))?;
        }
        scan(chunk_range(chunk, pow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::task::TaskKind;
    use std::cell::RefCell;

    const ARRAY: ObjRef = ObjRef::from_addr(0x2000_0000);

    #[derive(Default)]
    struct VecSink(RefCell<Vec<MarkTask>>);

    impl TaskSink for VecSink {
        fn push_task(&self, task: MarkTask) -> MarkResult<()> {
            self.0.borrow_mut().push(task);
            Ok(())
        }
    }

    /// Run start plus every continuation, returning scanned ranges in order
    /// of discovery and every pushed chunk's range.
    fn split_all(len: usize, stride: usize) -> (Vec<Range<usize>>, Vec<Range<usize>>) {
        let splitter = ArraySplitter::new(stride);
        let sink = VecSink::default();
        let mut scanned = Vec::new();
        let mut pushed = Vec::new();

        splitter
            .start(&sink, ARRAY, len, |r| {
                scanned.push(r);
                Ok(())
            })
            .unwrap();

        loop {
            let Some(task) = sink.0.borrow_mut().pop() else {
                break;
            };
            let TaskKind::ArrayChunk { array, chunk, pow } = task.kind() else {
                panic!("unexpected task {task:?}");
            };
            assert_eq!(array, ARRAY);
            pushed.push(chunk_range(chunk, pow));
            splitter
                .continue_chunk(&sink, array, chunk, pow, |r| {
                    scanned.push(r);
                    Ok(())
                })
                .unwrap();
        }
        (scanned, pushed)
    }

    fn assert_exact_cover(mut ranges: Vec<Range<usize>>, len: usize) {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by_key(|r| r.start);
        let mut next = 0;
        for r in ranges {
            assert_eq!(r.start, next, "gap or overlap at {next}");
            next = r.end;
        }
        assert_eq!(next, len);
    }

    #[test]
    fn test_short_array_scanned_whole() {
        let (scanned, pushed) = split_all(128, 64);
        assert_eq!(scanned, vec![0..128]);
        assert!(pushed.is_empty());
    }

    #[test]
    fn test_thousand_elements_stride_64() {
        let splitter = ArraySplitter::new(64);
        let sink = VecSink::default();
        let mut tail = Vec::new();
        splitter
            .start(&sink, ARRAY, 1000, |r| {
                tail.push(r);
                Ok(())
            })
            .unwrap();

        let pushed: Vec<_> = sink
            .0
            .borrow()
            .iter()
            .map(|t| chunk_range(t.chunk_index(), t.pow()))
            .collect();
        assert_eq!(pushed, vec![0..512, 512..768, 768..896, 896..960]);
        assert!(pushed.iter().all(|r| r.len() >= 64 && r.end <= 1000));
        assert_eq!(tail, vec![960..1000]);
    }

    #[test]
    fn test_ranges_cover_exactly() {
        for stride in [1, 3, 64, 512] {
            for len in (0..3000).step_by(37).chain([4096, 4097, 65_535, 1 << 20]) {
                let (scanned, pushed) = split_all(len, stride);
                assert!(pushed.iter().all(|r| r.end <= len), "len {len} stride {stride}");
                assert_exact_cover(scanned, len);
            }
        }
    }

    #[test]
    fn test_continuation_respects_stride() {
        let (scanned, _) = split_all(1 << 16, 512);
        assert!(scanned.iter().all(|r| r.len() <= 512));
    }

    #[test]
    fn test_pow_overflow_splits_eagerly() {
        let len = (1usize << 30) + 12_345;
        let splitter = ArraySplitter::new(512);
        let sink = VecSink::default();
        splitter.start(&sink, ARRAY, len, |_| Ok(())).unwrap();

        let first = sink.0.borrow()[0];
        assert_eq!(first.chunk_index(), 1);
        assert_eq!(first.pow(), 30);
    }

    #[test]
    fn test_chunk_ids_stay_within_capacity() {
        let len = MarkTask::MAX_ARRAY_LENGTH - 7;
        let (scanned, pushed) = split_all(len, 1);
        assert!(!pushed.is_empty());
        assert!(pushed.iter().all(|r| r.end <= len));
        assert_exact_cover(scanned, len);
    }
}
