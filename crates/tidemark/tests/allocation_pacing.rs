//! Integration tests for the allocation pacer under concurrent use.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tidemark::test_util::TestHeap;
use tidemark::{PaceOutcome, Pacer, PacerPhase, PacingConfig};

fn pacer(config: PacingConfig) -> (Arc<TestHeap>, Arc<Pacer<TestHeap>>) {
    let heap = Arc::new(TestHeap::new(16, 1024));
    let pacer = Arc::new(Pacer::new(Arc::clone(&heap), config).unwrap());
    (heap, pacer)
}

#[test]
fn test_phase_cycle_advances_epoch() {
    let (_heap, pacer) = pacer(PacingConfig::default());
    let phases = [
        PacerPhase::Idle,
        PacerPhase::Mark,
        PacerPhase::Evac,
        PacerPhase::UpdateRefs,
        PacerPhase::Idle,
    ];
    for (i, phase) in phases.into_iter().enumerate() {
        match phase {
            PacerPhase::Idle => pacer.setup_for_idle(),
            PacerPhase::Mark => pacer.setup_for_mark(),
            PacerPhase::Evac => pacer.setup_for_evac(),
            PacerPhase::UpdateRefs => pacer.setup_for_update_refs(),
        }
        assert_eq!(pacer.phase(), phase);
        assert_eq!(pacer.epoch(), i + 1);
        assert!(pacer.budget() >= 0);
        assert!(pacer.tax_rate() > 0.0);
    }
}

#[test]
fn test_concurrent_unforced_claims_never_overdraw() {
    let (_heap, pacer) = pacer(PacingConfig::default());
    pacer.restart_with(PacerPhase::Mark, 1000 * 8, 1.0);

    let granted = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pacer = Arc::clone(&pacer);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                for _ in 0..100 {
                    if pacer.claim_for_alloc(3, false) {
                        granted.fetch_add(3, Ordering::Relaxed);
                    }
                    assert!(pacer.budget() >= 0);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let granted = granted.load(Ordering::Relaxed);
    assert!(granted <= 1000);
    assert_eq!(
        pacer.budget(),
        1000 - isize::try_from(granted).unwrap()
    );
}

#[test]
fn test_allocators_keep_pace_with_collector() {
    let mut config = PacingConfig::default();
    config.set_max_delay(Duration::from_secs(5));
    let (_heap, pacer) = pacer(config);
    pacer.restart_with(PacerPhase::Mark, 0, 1.0);

    let done = Arc::new(AtomicBool::new(false));
    let collector = {
        let pacer = Arc::clone(&pacer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                pacer.report_mark(64);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let allocators: Vec<_> = (0..4)
        .map(|_| {
            let pacer = Arc::clone(&pacer);
            thread::spawn(move || {
                (0..50)
                    .map(|_| pacer.pace_for_alloc(16))
                    .filter(|&o| o == PaceOutcome::Claimed)
                    .count()
            })
        })
        .collect();
    let claimed: usize = allocators.into_iter().map(|h| h.join().unwrap()).sum();
    done.store(true, Ordering::Release);
    collector.join().unwrap();

    assert_eq!(claimed, 200);
    assert!(pacer.budget() >= 0);
    assert!(pacer.progress() >= 200 * 16);
}

#[test]
fn test_phase_change_releases_every_stalled_allocator() {
    let mut config = PacingConfig::default();
    config.set_max_delay(Duration::from_secs(30));
    let (_heap, pacer) = pacer(config);
    pacer.restart_with(PacerPhase::Mark, 0, 0.0);

    let stalled: Vec<_> = (0..4)
        .map(|_| {
            let pacer = Arc::clone(&pacer);
            thread::spawn(move || pacer.pace_for_alloc(100))
        })
        .collect();
    while pacer.stalled_threads() < 4 {
        thread::yield_now();
    }

    let start = Instant::now();
    pacer.setup_for_evac();
    for handle in stalled {
        assert_eq!(handle.join().unwrap(), PaceOutcome::EpochAdvanced);
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(pacer.delays().count(), 4);
}

#[test]
fn test_cancellation_releases_stalled_allocator_promptly() {
    let mut config = PacingConfig::default();
    config.set_max_delay(Duration::from_secs(30));
    let (heap, pacer) = pacer(config);
    pacer.restart_with(PacerPhase::Mark, 0, 0.0);

    let stalled = {
        let pacer = Arc::clone(&pacer);
        thread::spawn(move || pacer.pace_for_alloc(100))
    };
    while pacer.stalled_threads() == 0 {
        thread::yield_now();
    }

    let start = Instant::now();
    heap.cancel();
    pacer.notify_cancelled();
    assert_eq!(stalled.join().unwrap(), PaceOutcome::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(pacer.budget(), 0);
}

#[test]
fn test_refund_from_previous_epoch_is_dropped() {
    let (_heap, pacer) = pacer(PacingConfig::default());
    pacer.setup_for_idle();
    let epoch = pacer.epoch();
    assert!(pacer.claim_for_alloc(10, false));

    pacer.setup_for_mark();
    let budget = pacer.budget();
    pacer.unpace_for_alloc(epoch, 10);
    assert_eq!(pacer.budget(), budget);

    pacer.unpace_for_alloc(pacer.epoch(), 10);
    assert_eq!(pacer.budget(), budget + 10);
}

#[test]
fn test_report_lists_stalls() {
    let mut config = PacingConfig::default();
    config.set_max_delay(Duration::from_millis(2));
    let (_heap, pacer) = pacer(config);
    pacer.restart_with(PacerPhase::Mark, 0, 0.0);

    assert_eq!(pacer.pace_for_alloc(1), PaceOutcome::TimedOut);
    let report = pacer.to_string();
    assert!(report.starts_with("ALLOCATION PACING:"));
    assert!(report.contains("Total"));
}
