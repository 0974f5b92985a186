//! Reader/writer spinlock tuned for short critical sections over in-memory
//! structures.
//!
//! Readers pay one sharded-counter increment on the uncontended path.
//! Writers form a FIFO chain of nodes: each installs itself as the new
//! tail, waits for its predecessor to hand off, then waits for the reader
//! count to drain. Readers arriving while a writer is queued park on the
//! tail node and retry once that writer completes, which bounds writer
//! starvation. Both sides are reentrant on the owning thread; nested
//! acquisitions never touch shared state.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::primitives::counter::ShardedCounter;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

const DRAIN_SPINS_BEFORE_YIELD: u32 = 64;

thread_local! {
    static READ_DEPTHS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
    static WRITE_SLOTS: RefCell<HashMap<u64, WriteSlot>> = RefCell::new(HashMap::new());
}

struct WriteSlot {
    depth: usize,
    node: Arc<WriterNode>,
}

struct WriterNode {
    /// Cleared by the predecessor when the chain reaches this node.
    locked: AtomicBool,
    /// Set when this writer has released; readers parked here retry then.
    completed: AtomicBool,
    handoff: Mutex<Handoff>,
    waiting_readers: Mutex<Vec<Thread>>,
    thread: Thread,
}

#[derive(Default)]
struct Handoff {
    released: bool,
    successor: Option<Arc<WriterNode>>,
}

impl WriterNode {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            handoff: Mutex::new(Handoff::default()),
            waiting_readers: Mutex::new(Vec::new()),
            thread: thread::current(),
        }
    }
}

/// Multiple-reader, single-writer spinlock with FIFO writer queueing.
///
/// Invariant violations (releasing a side the calling thread does not
/// hold, or the reader counter going negative) panic: they indicate a bug
/// in the core, not a recoverable condition.
pub struct ReadersWriterSpinLock {
    id: u64,
    readers: ShardedCounter,
    /// Writers queued or active. Readers consult this flag on every
    /// acquisition; it pairs with the sharded counter's SeqCst discipline.
    writers_pending: AtomicUsize,
    tail: Mutex<Option<Arc<WriterNode>>>,
}

impl Default for ReadersWriterSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadersWriterSpinLock {
    /// Creates an unlocked instance.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            readers: ShardedCounter::new(),
            writers_pending: AtomicUsize::new(0),
            tail: Mutex::new(None),
        }
    }

    /// Acquires the lock in shared mode, blocking while a writer is queued
    /// or active. Reentrant: nested acquisitions on the holding thread
    /// return immediately.
    pub fn acquire_read(&self) {
        if self.enter_nested_read() {
            return;
        }
        if self.grant_read_under_held_write() {
            return;
        }
        loop {
            self.readers.increment();
            if self.writers_pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            // Back out and queue behind the most recent writer.
            self.readers.decrement();
            let Some(node) = self.tail.lock().clone() else {
                continue;
            };
            node.waiting_readers.lock().push(thread::current());
            while !node.completed.load(Ordering::SeqCst) {
                thread::park();
            }
        }
        self.set_read_depth(1);
    }

    /// Like [`acquire_read`](Self::acquire_read) but gives up after
    /// `timeout`, restoring all state. Returns whether the lock was taken.
    pub fn try_acquire_read(&self, timeout: Duration) -> bool {
        if self.enter_nested_read() {
            return true;
        }
        if self.grant_read_under_held_write() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.readers.increment();
            if self.writers_pending.load(Ordering::SeqCst) == 0 {
                self.set_read_depth(1);
                return true;
            }
            self.readers.decrement();
            if Instant::now() >= deadline {
                return false;
            }
            let Some(node) = self.tail.lock().clone() else {
                continue;
            };
            let me = thread::current();
            node.waiting_readers.lock().push(me.clone());
            loop {
                if node.completed.load(Ordering::SeqCst) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    node.waiting_readers
                        .lock()
                        .retain(|waiter| waiter.id() != me.id());
                    return false;
                }
                thread::park_timeout(deadline - now);
            }
        }
    }

    /// Releases one level of shared acquisition; the outermost release
    /// decrements the shared reader counter.
    pub fn release_read(&self) {
        READ_DEPTHS.with(|depths| {
            let mut depths = depths.borrow_mut();
            let depth = depths
                .get_mut(&self.id)
                .unwrap_or_else(|| panic!("read lock released by a thread that does not hold it"));
            *depth -= 1;
            if *depth == 0 {
                depths.remove(&self.id);
                self.readers.decrement();
            }
        });
    }

    /// Acquires the lock exclusively. Writers are admitted in FIFO order;
    /// reentrant on the owning thread.
    pub fn acquire_write(&self) {
        let nested = WRITE_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = slots.get_mut(&self.id) {
                slot.depth += 1;
                true
            } else {
                false
            }
        });
        if nested {
            return;
        }

        let node = Arc::new(WriterNode::new());
        self.writers_pending.fetch_add(1, Ordering::SeqCst);
        let predecessor = self.tail.lock().replace(Arc::clone(&node));
        if let Some(prev) = predecessor {
            let must_wait = {
                let mut handoff = prev.handoff.lock();
                if handoff.released {
                    false
                } else {
                    handoff.successor = Some(Arc::clone(&node));
                    true
                }
            };
            if must_wait {
                while node.locked.load(Ordering::SeqCst) {
                    thread::park();
                }
            }
        }

        // Head of the chain: wait for in-flight readers to drain.
        let mut spins = 0u32;
        loop {
            let active = self.readers.sum();
            assert!(active >= 0, "reader counter went negative: {active}");
            if active == 0 {
                break;
            }
            if spins < DRAIN_SPINS_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }

        WRITE_SLOTS.with(|slots| {
            slots.borrow_mut().insert(self.id, WriteSlot { depth: 1, node });
        });
    }

    /// Releases one level of exclusive acquisition. The outermost release
    /// hands the chain to the queued successor (if any) and unparks every
    /// reader queued on this writer's node.
    pub fn release_write(&self) {
        let node = WRITE_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots
                .get_mut(&self.id)
                .unwrap_or_else(|| panic!("write lock released by a thread that does not hold it"));
            slot.depth -= 1;
            if slot.depth == 0 {
                slots.remove(&self.id).map(|slot| slot.node)
            } else {
                None
            }
        });
        let Some(node) = node else {
            return;
        };

        let successor = {
            let mut handoff = node.handoff.lock();
            handoff.released = true;
            handoff.successor.take()
        };
        if successor.is_none() {
            // Still the tail unless a new writer swapped in concurrently.
            let mut tail = self.tail.lock();
            if tail.as_ref().is_some_and(|current| Arc::ptr_eq(current, &node)) {
                *tail = None;
            }
        }

        node.completed.store(true, Ordering::SeqCst);
        self.writers_pending.fetch_sub(1, Ordering::SeqCst);

        if let Some(successor) = successor {
            successor.locked.store(false, Ordering::SeqCst);
            successor.thread.unpark();
        }
        for waiter in node.waiting_readers.lock().drain(..) {
            waiter.unpark();
        }
    }

    /// A thread holding the write lock already has exclusive access, so a
    /// read acquisition must be granted immediately: taking the normal
    /// path it would queue behind its own writer node and park forever.
    /// The reader still registers on the shared counter, so a successor
    /// writer drains it if the write side is released first.
    fn grant_read_under_held_write(&self) -> bool {
        let holds_write = WRITE_SLOTS.with(|slots| slots.borrow().contains_key(&self.id));
        if !holds_write {
            return false;
        }
        self.readers.increment();
        self.set_read_depth(1);
        true
    }

    fn enter_nested_read(&self) -> bool {
        READ_DEPTHS.with(|depths| {
            let mut depths = depths.borrow_mut();
            match depths.get_mut(&self.id) {
                Some(depth) => {
                    *depth += 1;
                    true
                }
                None => false,
            }
        })
    }

    fn set_read_depth(&self, depth: usize) {
        READ_DEPTHS.with(|depths| {
            depths.borrow_mut().insert(self.id, depth);
        });
    }
}
