//! Concurrent marking and allocation pacing for region-based collectors.
//!
//! `tidemark` implements the marking half of a concurrent, snapshot-at-the-
//! beginning tracing collector, together with the pacer that keeps allocating
//! threads from outrunning it. The collector that embeds it owns the heap:
//! object layout, regions, forwarding and the collection set are reached
//! through the [`Heap`] trait.
//!
//! # Features
//!
//! - **Claim-once marking**: every reachable object is queued exactly once,
//!   whichever thread reaches it first
//! - **Chunked arrays**: large reference arrays are split into power-of-two
//!   chunks so that several workers can scan them
//! - **Work stealing**: per-worker queues with a shared, configurable overflow
//!   store
//! - **Relocation aware**: references can be resolved and updated in place
//!   while marking runs alongside evacuation
//! - **Live data**: per-region live words are accumulated without contention
//! - **Allocation pacing**: a tax-and-spend budget with bounded, cancellable
//!   stalls
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tidemark::test_util::TestHeap;
//! use tidemark::{ConcurrentMark, MarkConfig, UpdateRefsMode};
//!
//! let mut heap = TestHeap::new(4, 1024);
//! let root = heap.alloc_instance(1);
//! let child = heap.alloc_obj_array(10);
//! heap.set_field(root, 0, child);
//! let heap = Arc::new(heap);
//!
//! let mut cm = ConcurrentMark::new(Arc::clone(&heap), MarkConfig::new(2)).unwrap();
//! cm.mark_start();
//! cm.mark_roots(&[heap.root(root)], UpdateRefsMode::None).unwrap();
//! let stats = cm.mark_parallel(UpdateRefsMode::None).unwrap();
//!
//! assert!(stats.is_complete());
//! assert!(heap.is_marked(child));
//! ```
//!
//! # Pacing
//!
//! A [`Pacer`] is set up for each collector phase. Collector threads report
//! work, allocators claim budget and stall in [`Pacer::pace_for_alloc`] when it
//! runs out. Attach it to the marker with [`ConcurrentMark::with_pacer`] to
//! have marking progress reported automatically.
//!
//! # Thread Safety
//!
//! [`mark_through_ref`], [`Pacer`] and [`mark::SatbQueueSet`] may be used from
//! any number of threads. [`ConcurrentMark`] drives its own worker threads and
//! takes `&mut self` for cycle-level operations.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod heap;
pub mod mark;
pub mod metrics;
pub mod oop;
pub mod pacer;
pub mod tracing;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;

pub use config::{MarkConfig, OverflowPolicy, PacingConfig};
pub use error::{ConfigError, MarkError, MarkResult};
pub use heap::{Heap, ObjectKind, RegionKind, SlotVisitor, HEAP_WORD_SIZE};
pub use mark::{
    mark_through_ref, ConcurrentMark, MarkBitmap, MarkTask, MarkingContext, UpdateRefsMode,
};
pub use metrics::{DelayHistogram, MarkOutcome, MarkStats, WorkerStats};
pub use oop::{ObjRef, RefEncoding, RefSlot};
pub use pacer::{PaceOutcome, Pacer, PacerBudget, PacerPhase};
