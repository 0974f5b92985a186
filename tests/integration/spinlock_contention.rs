//! Cross-thread contention scenarios for the reader/writer spinlock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use umbra::primitives::spinlock::ReadersWriterSpinLock;

#[test]
fn writer_waits_for_every_reader_to_leave() {
    let lock = Arc::new(ReadersWriterSpinLock::new());
    let stage = Arc::new(AtomicU32::new(0));

    lock.acquire_read();

    let second_reader_lock = Arc::clone(&lock);
    let second_reader_stage = Arc::clone(&stage);
    let second_reader = thread::spawn(move || {
        second_reader_lock.acquire_read();
        second_reader_stage.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        second_reader_lock.release_read();
    });

    // Let the second reader in before the writer queues.
    while stage.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }

    let writer_lock = Arc::clone(&lock);
    let writer_stage = Arc::clone(&stage);
    let writer = thread::spawn(move || {
        writer_lock.acquire_write();
        writer_stage.store(10, Ordering::SeqCst);
        writer_lock.release_write();
    });

    thread::sleep(Duration::from_millis(50));
    assert_ne!(
        stage.load(Ordering::SeqCst),
        10,
        "writer entered while readers held the lock"
    );

    lock.release_read();
    second_reader.join().unwrap();
    writer.join().unwrap();
    assert_eq!(stage.load(Ordering::SeqCst), 10);
}

#[test]
fn reader_arriving_behind_a_queued_writer_waits_for_it() {
    let lock = Arc::new(ReadersWriterSpinLock::new());
    // 0 = writer not entered, 1 = writer inside, 2 = writer done.
    let stage = Arc::new(AtomicU32::new(0));

    lock.acquire_read();

    let writer_lock = Arc::clone(&lock);
    let writer_stage = Arc::clone(&stage);
    let writer = thread::spawn(move || {
        writer_lock.acquire_write();
        writer_stage.store(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        writer_stage.store(2, Ordering::SeqCst);
        writer_lock.release_write();
    });

    // Give the writer time to queue behind the held read lock.
    thread::sleep(Duration::from_millis(100));

    let late_reader_lock = Arc::clone(&lock);
    let late_reader_stage = Arc::clone(&stage);
    let late_reader = thread::spawn(move || {
        late_reader_lock.acquire_read();
        // Admission only after the queued writer completed.
        assert_eq!(late_reader_stage.load(Ordering::SeqCst), 2);
        late_reader_lock.release_read();
    });

    thread::sleep(Duration::from_millis(50));
    lock.release_read();
    writer.join().unwrap();
    late_reader.join().unwrap();
}

#[test]
fn queued_writers_are_admitted_in_fifo_order() {
    let lock = Arc::new(ReadersWriterSpinLock::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    lock.acquire_write();
    let mut handles = Vec::new();
    for writer in 0..4 {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            lock.acquire_write();
            order.lock().push(writer);
            lock.release_write();
        }));
        // Serialize queue installation so the expected order is known.
        thread::sleep(Duration::from_millis(50));
    }

    lock.release_write();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn timed_read_restores_state_on_timeout() {
    let lock = Arc::new(ReadersWriterSpinLock::new());
    lock.acquire_write();

    let contender = Arc::clone(&lock);
    let timed_out = thread::spawn(move || !contender.try_acquire_read(Duration::from_millis(50)))
        .join()
        .unwrap();
    assert!(timed_out);

    lock.release_write();

    // The failed attempt must not have leaked a reader registration: a
    // writer can still drain to zero and enter.
    let writer = Arc::clone(&lock);
    thread::spawn(move || {
        writer.acquire_write();
        writer.release_write();
    })
    .join()
    .unwrap();
}
