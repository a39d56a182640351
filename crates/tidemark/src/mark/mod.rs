//! Concurrent marking.
//!
//! This module provides the marking engine:
//! - Packed mark tasks and the chunked array splitter
//! - Per-worker queues with a shared overflow store
//! - The claim-once mark bitmap and reference marking protocol
//! - Snapshot-at-the-beginning buffer processing
//! - Per-worker live-data accounting
//! - Parallel workers with work stealing and termination

pub(crate) mod asserts;
pub mod bitmap;
pub mod concurrent;
pub mod dedup;
pub mod live_data;
pub mod queue;
pub mod satb;
pub mod splitter;
pub mod task;
pub mod worker;

pub use bitmap::{MarkBitmap, MarkingContext};
pub use concurrent::{mark_through_ref, ConcurrentMark, MarkRefsClosure, UpdateRefsMode};
pub use dedup::{DedupQueue, DedupSink, StringDedup};
pub use live_data::LiveData;
pub use queue::{LocalQueue, ObjToScanQueue, OverflowStore};
pub use satb::{SatbBufferClosure, SatbMarkQueue, SatbQueueSet, DEFAULT_SATB_BUFFER_SIZE};
pub use splitter::{ArraySplitter, TaskSink};
pub use task::{chunk_range, MarkTask, TaskKind};
pub use worker::MarkTerminator;
