//! Integration tests for parallel concurrent marking.
//!
//! Random object graphs are marked with `mark_parallel` and checked against
//! an oracle walk of the same graph: the marked set must equal the reachable
//! set, and every region's live words must match the sizes of the reachable
//! objects that start in it.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tidemark::mark::{DedupQueue, StringDedup};
use tidemark::test_util::TestHeap;
use tidemark::{
    ConcurrentMark, Heap, MarkConfig, MarkError, MarkOutcome, ObjRef, ObjectKind, OverflowPolicy,
    Pacer, PacingConfig, RegionKind, UpdateRefsMode,
};

const REGIONS: usize = 128;
const REGION_WORDS: usize = 4096;

struct Graph {
    heap: TestHeap,
    roots: Vec<ObjRef>,
}

/// Build a random graph. The first objects allocated are small instances, so
/// the leading regions hold only regular objects.
fn random_graph(seed: u64, mut heap: TestHeap, objects: usize) -> Graph {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut all = Vec::with_capacity(objects);

    for _ in 0..objects.min(200) {
        all.push(heap.alloc_instance(rng.gen_range(0..4)));
    }
    for _ in all.len()..objects {
        let obj = match rng.gen_range(0..100) {
            0..=69 => heap.alloc_instance(rng.gen_range(0..6)),
            70..=89 => heap.alloc_obj_array(rng.gen_range(0..1500)),
            _ => heap.alloc_type_array(rng.gen_range(0..100)),
        };
        all.push(obj);
    }
    // A couple of humongous objects, one of them holding references.
    let big_refs = heap.alloc_obj_array(REGION_WORDS * 2);
    let big_data = heap.alloc_type_array(REGION_WORDS + 10);
    all.push(big_refs);
    all.push(big_data);

    for &obj in &all {
        let slots = match heap.object_kind(obj) {
            ObjectKind::TypeArray => 0,
            ObjectKind::ObjArray => heap.array_length(obj),
            ObjectKind::Instance => heap.object_size_words(obj) - tidemark::test_util::HEADER_WORDS,
        };
        for i in 0..slots {
            if rng.gen_bool(0.4) {
                heap.set_field(obj, i, all[rng.gen_range(0..all.len())]);
            }
        }
    }

    let mut roots: Vec<_> = (0..8).map(|_| all[rng.gen_range(0..all.len())]).collect();
    roots.push(big_refs);
    Graph { heap, roots }
}

fn run_mark(
    heap: &Arc<TestHeap>,
    roots: &[ObjRef],
    config: MarkConfig,
    mode: UpdateRefsMode,
) -> tidemark::MarkStats {
    let mut cm = ConcurrentMark::new(Arc::clone(heap), config).unwrap();
    cm.mark_start();
    let slots: Vec<_> = roots.iter().map(|&r| heap.root(r)).collect();
    cm.mark_roots(&slots, mode).unwrap();
    let stats = cm.mark_parallel(mode).unwrap();
    assert!(!cm.has_pending_work());
    stats
}

fn assert_matches_oracle(heap: &TestHeap, roots: &[ObjRef]) {
    let reachable = heap.reachable(roots);
    let marked: HashSet<_> = heap
        .objects()
        .iter()
        .copied()
        .filter(|&o| heap.is_marked(o))
        .collect();
    assert_eq!(marked, reachable);

    let expected = heap.expected_live_words(&reachable);
    for (region, &words) in expected.iter().enumerate() {
        assert_eq!(
            heap.live_data_words(region),
            words,
            "live words of region {region}"
        );
    }
}

#[test]
fn test_random_graphs_mark_reachable_set() {
    for (seed, workers) in [(1, 1), (2, 2), (3, 4), (4, 8)] {
        let graph = random_graph(seed, TestHeap::new(REGIONS, REGION_WORDS), 1500);
        let heap = Arc::new(graph.heap);

        let stats = run_mark(&heap, &graph.roots, MarkConfig::new(workers), UpdateRefsMode::None);

        assert!(stats.is_complete());
        assert_eq!(stats.workers.len(), workers);
        assert_eq!(stats.total_objects(), heap.reachable(&graph.roots).len());
        assert_matches_oracle(&heap, &graph.roots);
    }
}

#[test]
fn test_humongous_chain_is_fully_live() {
    let mut heap = TestHeap::new(8, 256);
    let small = heap.alloc_instance(1);
    let big = heap.alloc_type_array(600);
    heap.set_field(small, 0, big);
    let heap = Arc::new(heap);

    run_mark(&heap, &[small], MarkConfig::new(2), UpdateRefsMode::None);

    assert_eq!(heap.region_kind(1), RegionKind::HumongousStart);
    assert_eq!(heap.live_data_words(0), heap.object_size_words(small));
    assert_eq!(heap.live_data_words(1), 256);
    assert_eq!(heap.live_data_words(2), 256);
    assert_eq!(heap.live_data_words(3), 91);
}

#[test]
fn test_overhead_words_are_counted() {
    let graph = random_graph(
        11,
        TestHeap::new(REGIONS, REGION_WORDS).with_overhead_words(1),
        800,
    );
    let heap = Arc::new(graph.heap);
    run_mark(&heap, &graph.roots, MarkConfig::new(3), UpdateRefsMode::None);
    assert_matches_oracle(&heap, &graph.roots);
}

#[test]
fn test_compressed_references() {
    let graph = random_graph(
        12,
        TestHeap::new(REGIONS, REGION_WORDS).with_compressed_refs(),
        800,
    );
    let heap = Arc::new(graph.heap);
    run_mark(&heap, &graph.roots, MarkConfig::new(4), UpdateRefsMode::None);
    assert_matches_oracle(&heap, &graph.roots);
}

#[test]
fn test_small_queues_spill_without_losing_work() {
    let graph = random_graph(13, TestHeap::new(REGIONS, REGION_WORDS), 1200);
    let heap = Arc::new(graph.heap);

    let mut config = MarkConfig::new(2);
    config.local_queue_capacity = 2;
    config.set_overflow(OverflowPolicy::Spill { capacity: 4 });
    config.set_stride(16);
    run_mark(&heap, &graph.roots, config, UpdateRefsMode::None);

    assert_matches_oracle(&heap, &graph.roots);
}

#[test]
fn test_bounded_overflow_fails_loudly() {
    let mut heap = TestHeap::new(4, 4096);
    let fan = heap.alloc_obj_array(100);
    for i in 0..100 {
        let leaf = heap.alloc_instance(0);
        heap.set_element(fan, i, leaf);
    }
    let heap = Arc::new(heap);

    let mut config = MarkConfig::new(1);
    config.local_queue_capacity = 2;
    config.set_overflow(OverflowPolicy::Fail { capacity: 1 });
    let mut cm = ConcurrentMark::new(Arc::clone(&heap), config).unwrap();
    cm.mark_start();
    cm.mark_roots(&[heap.root(fan)], UpdateRefsMode::None).unwrap();

    let err = cm.mark_parallel(UpdateRefsMode::None).unwrap_err();
    assert_eq!(err, MarkError::QueueExhausted { capacity: 1 });
    // Queued work is abandoned after the failure.
    assert!(!cm.has_pending_work());
}

/// Evacuate every object of `region` and return the copies' originals.
fn evacuate_region(heap: &mut TestHeap, region: usize) -> Vec<ObjRef> {
    let victims: Vec<_> = heap
        .objects()
        .iter()
        .copied()
        .filter(|&o| heap.region_index_containing(o) == region)
        .collect();
    for &obj in &victims {
        heap.evacuate(obj);
    }
    victims
}

#[test]
fn test_update_modes_leave_no_stale_references() {
    for mode in [UpdateRefsMode::Simple, UpdateRefsMode::Concurrent] {
        let mut graph = random_graph(21, TestHeap::new(REGIONS, REGION_WORDS), 1000);
        let moved = evacuate_region(&mut graph.heap, 0);
        assert!(!moved.is_empty());
        let heap = Arc::new(graph.heap);

        run_mark(&heap, &graph.roots, MarkConfig::new(4), mode);

        let reachable = heap.reachable(&graph.roots);
        for &obj in &moved {
            assert!(!heap.is_marked(obj), "{obj:?} is an old copy");
        }
        for &obj in &reachable {
            assert!(heap.is_marked(obj));
            assert!(!heap.in_collection_set(obj));
            let slots = match heap.object_kind(obj) {
                ObjectKind::TypeArray => 0,
                ObjectKind::ObjArray => heap.array_length(obj),
                ObjectKind::Instance => {
                    heap.object_size_words(obj) - tidemark::test_util::HEADER_WORDS
                }
            };
            for i in 0..slots {
                let target = heap.field(obj, i);
                assert!(
                    target.is_null() || !heap.is_forwarded(target),
                    "{mode:?}: field {i} of {obj:?} still points at {target:?}"
                );
            }
        }
    }
}

#[test]
fn test_resolve_mode_marks_copies_only() {
    let mut graph = random_graph(22, TestHeap::new(REGIONS, REGION_WORDS), 600);
    let moved = evacuate_region(&mut graph.heap, 0);
    let heap = Arc::new(graph.heap);

    run_mark(&heap, &graph.roots, MarkConfig::new(2), UpdateRefsMode::Resolve);

    assert!(moved.iter().all(|&o| !heap.is_marked(o)));
    let reachable = heap.reachable(&graph.roots);
    assert!(reachable.iter().all(|&o| heap.is_marked(o)));
}

#[test]
fn test_cancellation_abandons_work() {
    let graph = random_graph(31, TestHeap::new(REGIONS, REGION_WORDS), 1500);
    let heap = Arc::new(graph.heap);

    let mut config = MarkConfig::new(4);
    config.progress_report_stride = 1;
    let mut cm = ConcurrentMark::new(Arc::clone(&heap), config).unwrap();
    cm.mark_start();
    let slots: Vec<_> = graph.roots.iter().map(|&r| heap.root(r)).collect();
    cm.mark_roots(&slots, UpdateRefsMode::None).unwrap();
    heap.cancel();

    let stats = cm.mark_parallel(UpdateRefsMode::None).unwrap();
    assert_eq!(stats.outcome, MarkOutcome::Cancelled);
    assert!(!stats.is_complete());
    assert!(!cm.has_pending_work());
    assert!(!cm.satb_queue_set().is_active());
}

#[test]
fn test_marking_reports_progress_to_pacer() {
    let graph = random_graph(41, TestHeap::new(REGIONS, REGION_WORDS), 800);
    let heap = Arc::new(graph.heap);
    let pacer = Arc::new(Pacer::new(Arc::clone(&heap), PacingConfig::default()).unwrap());
    pacer.setup_for_mark();
    let budget = pacer.budget();

    let mut config = MarkConfig::new(3);
    config.progress_report_stride = 16;
    let mut cm = ConcurrentMark::new(Arc::clone(&heap), config)
        .unwrap()
        .with_pacer(Arc::clone(&pacer));
    cm.mark_start();
    let slots: Vec<_> = graph.roots.iter().map(|&r| heap.root(r)).collect();
    cm.mark_roots(&slots, UpdateRefsMode::None).unwrap();
    let stats = cm.mark_parallel(UpdateRefsMode::None).unwrap();

    assert!(stats.total_words() > 0);
    assert_eq!(pacer.progress(), stats.total_words());
    assert!(pacer.budget() > budget);
}

#[test]
fn test_progress_counts_each_word_once() {
    let mut heap = TestHeap::new(16, 1 << 14);
    let root = heap.alloc_obj_array(10_000);
    for i in (0..10_000).step_by(10) {
        let leaf = heap.alloc_instance(1);
        heap.set_element(root, i, leaf);
    }
    let heap = Arc::new(heap);
    let expected: usize = heap
        .reachable(&[root])
        .iter()
        .map(|&o| heap.object_size_words(o))
        .sum();
    assert_eq!(expected, 10_003 + 1000 * 3);

    for workers in [1, 4] {
        heap.reset_cycle();
        let pacer = Arc::new(Pacer::new(Arc::clone(&heap), PacingConfig::default()).unwrap());
        pacer.setup_for_mark();

        let mut config = MarkConfig::new(workers);
        config.set_stride(64);
        config.progress_report_stride = 7;
        let mut cm = ConcurrentMark::new(Arc::clone(&heap), config)
            .unwrap()
            .with_pacer(Arc::clone(&pacer));
        cm.mark_start();
        cm.mark_roots(&[heap.root(root)], UpdateRefsMode::None).unwrap();
        let stats = cm.mark_parallel(UpdateRefsMode::None).unwrap();

        assert!(stats.is_complete());
        assert_eq!(stats.total_words(), expected, "workers = {workers}");
        assert_eq!(pacer.progress(), expected, "workers = {workers}");
    }
}

struct TypeArraysOnly(Arc<TestHeap>);

impl StringDedup for TypeArraysOnly {
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_candidate(&self, obj: ObjRef) -> bool {
        self.0.object_kind(obj) == ObjectKind::TypeArray
    }

    fn enqueue_candidate(&self, obj: ObjRef, queue: &DedupQueue) {
        queue.push(obj);
    }
}

#[test]
fn test_dedup_candidates_are_collected() {
    let graph = random_graph(51, TestHeap::new(REGIONS, REGION_WORDS), 800);
    let heap = Arc::new(graph.heap);

    let mut config = MarkConfig::new(2);
    config.set_dedup(true);
    let mut cm = ConcurrentMark::new(Arc::clone(&heap), config)
        .unwrap()
        .with_string_dedup(Arc::new(TypeArraysOnly(Arc::clone(&heap))));
    cm.mark_start();
    let slots: Vec<_> = graph.roots.iter().map(|&r| heap.root(r)).collect();
    cm.mark_roots(&slots, UpdateRefsMode::None).unwrap();
    cm.mark_parallel(UpdateRefsMode::None).unwrap();

    let found: HashSet<_> = cm.take_dedup_candidates().into_iter().collect();
    let expected: HashSet<_> = heap
        .reachable(&graph.roots)
        .into_iter()
        .filter(|&o| heap.object_kind(o) == ObjectKind::TypeArray)
        .collect();
    assert_eq!(found, expected);
    assert!(cm.take_dedup_candidates().is_empty());
}

#[test]
fn test_marking_twice_after_reset() {
    let graph = random_graph(61, TestHeap::new(REGIONS, REGION_WORDS), 500);
    let heap = Arc::new(graph.heap);
    let mut cm = ConcurrentMark::new(Arc::clone(&heap), MarkConfig::new(2)).unwrap();
    let slots: Vec<_> = graph.roots.iter().map(|&r| heap.root(r)).collect();

    for _ in 0..2 {
        heap.reset_cycle();
        cm.mark_start();
        cm.mark_roots(&slots, UpdateRefsMode::None).unwrap();
        let stats = cm.mark_parallel(UpdateRefsMode::None).unwrap();
        assert!(stats.is_complete());
        assert_matches_oracle(&heap, &graph.roots);
    }
}
