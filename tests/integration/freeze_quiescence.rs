//! Freeze-under-load scenarios: quiescence, blocking starters, fail-fast
//! policies and resumption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use umbra::primitives::freeze::{FreezePolicy, OperationsFreezer};
use umbra::types::UmbraError;

#[test]
fn freeze_returns_only_at_true_quiescence() {
    let freezer = Arc::new(OperationsFreezer::new());
    let completed = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::new();
    for _ in 0..6 {
        let freezer = Arc::clone(&freezer);
        let completed = Arc::clone(&completed);
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                freezer.start_operation().unwrap();
                // Simulated work inside the operation.
                thread::sleep(Duration::from_micros(200));
                completed.fetch_add(1, Ordering::SeqCst);
                freezer.end_operation();
            }
        }));
    }

    // Let the workers build up steady traffic.
    while completed.load(Ordering::SeqCst) < 50 {
        thread::yield_now();
    }

    let freeze_id = freezer.freeze_operations(None);
    // The freeze returned: nothing may be in flight.
    assert_eq!(freezer.operations_count(), 0);

    // With every starter blocked, the completion counter stays put.
    let snapshot = completed.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(completed.load(Ordering::SeqCst), snapshot);

    freezer.release_operations(freeze_id);

    // Workers resume after release.
    while completed.load(Ordering::SeqCst) == snapshot {
        thread::yield_now();
    }

    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn fail_fast_freeze_rejects_while_blocking_freeze_waits() {
    let freezer = Arc::new(OperationsFreezer::new());

    let fail_fast = freezer.freeze_operations(Some(FreezePolicy::fail_fast("storage backup")));
    match freezer.start_operation().unwrap_err() {
        UmbraError::Frozen { reason } => assert_eq!(reason, "storage backup"),
        other => panic!("unexpected error: {other:?}"),
    }
    freezer.release_operations(fail_fast);

    // Without a policy the starter blocks instead of failing.
    let blocking = freezer.freeze_operations(None);
    let started = Arc::new(AtomicBool::new(false));
    let worker_freezer = Arc::clone(&freezer);
    let worker_started = Arc::clone(&started);
    let worker = thread::spawn(move || {
        worker_freezer.start_operation().unwrap();
        worker_started.store(true, Ordering::SeqCst);
        worker_freezer.end_operation();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!started.load(Ordering::SeqCst));
    freezer.release_operations(blocking);
    worker.join().unwrap();
    assert!(started.load(Ordering::SeqCst));
}

#[test]
fn overlapping_freezes_hold_until_the_last_release() {
    let freezer = Arc::new(OperationsFreezer::new());
    let first = freezer.freeze_operations(None);
    let second = freezer.freeze_operations(None);

    let resumed = Arc::new(AtomicBool::new(false));
    let worker_freezer = Arc::clone(&freezer);
    let worker_resumed = Arc::clone(&resumed);
    let worker = thread::spawn(move || {
        worker_freezer.start_operation().unwrap();
        worker_resumed.store(true, Ordering::SeqCst);
        worker_freezer.end_operation();
    });

    freezer.release_operations(second);
    thread::sleep(Duration::from_millis(100));
    assert!(
        !resumed.load(Ordering::SeqCst),
        "starter resumed while one freeze still held"
    );

    freezer.release_operations(first);
    worker.join().unwrap();
    assert!(resumed.load(Ordering::SeqCst));
}

#[test]
fn nested_operations_survive_a_concurrent_freeze_request() {
    let freezer = Arc::new(OperationsFreezer::new());
    freezer.start_operation().unwrap();
    // Nested registration is thread-local and must not block even while a
    // freeze is waiting for this very operation to finish.
    let freeze_freezer = Arc::clone(&freezer);
    let frozen = thread::spawn(move || {
        let id = freeze_freezer.freeze_operations(None);
        freeze_freezer.release_operations(id);
    });

    thread::sleep(Duration::from_millis(50));
    freezer.start_operation().unwrap();
    freezer.end_operation();
    freezer.end_operation();

    frozen.join().unwrap();
    assert_eq!(freezer.operations_count(), 0);
}
