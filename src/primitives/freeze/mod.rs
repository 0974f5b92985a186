//! In-flight operation bookkeeping and the administrative freeze barrier.
//!
//! The hot path, starting and ending an operation while no freeze is
//! active, is a single sharded-counter increment or decrement. Freezing
//! stops new operations, drains the ones in flight and returns only at
//! true quiescence, the precondition for a consistent on-disk snapshot.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread::{self, Thread};

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::counter::ShardedCounter;
use crate::types::{Result, UmbraError};

static NEXT_FREEZER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OPERATION_DEPTHS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Threads parked while a freeze is in progress.
///
/// Registration happens only on the freeze path, never on the hot path, so
/// a mutex-guarded list is sufficient here; what matters is that a cut can
/// never miss a thread registering concurrently, which the mutex gives us
/// directly.
#[derive(Default)]
pub struct WaitingList {
    waiters: Mutex<Vec<Thread>>,
}

impl WaitingList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the calling thread's handle.
    pub fn register(&self, thread: Thread) {
        self.waiters.lock().push(thread);
    }

    /// Detaches and returns every currently registered waiter.
    pub fn cut(&self) -> Vec<Thread> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

/// How new operations behave while a particular freeze holds.
///
/// With a policy registered, `start_operation` fails fast with
/// [`UmbraError::Frozen`] instead of blocking, the contract interactive
/// callers rely on during long freeze windows such as backups.
#[derive(Clone, Debug)]
pub struct FreezePolicy {
    /// Message surfaced to callers rejected by this freeze.
    pub reason: String,
}

impl FreezePolicy {
    /// Builds a fail-fast policy with the given reason.
    pub fn fail_fast(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Identifier of one active freeze request.
pub type FreezeId = u64;

/// Quiescence barrier over in-flight mutating operations.
///
/// `start_operation`/`end_operation` are reentrant per thread; only the
/// outermost transition touches the shared counter. Multiple freezes may
/// coexist (a backup nested inside a schema change); operations resume
/// when the last one is released.
pub struct OperationsFreezer {
    id: u64,
    operations: ShardedCounter,
    /// Number of active freeze requests; pairs with the SeqCst counter
    /// discipline so a starter and a freezer always observe one another.
    freeze_requests: AtomicI64,
    params: Mutex<HashMap<FreezeId, Option<FreezePolicy>>>,
    next_freeze_id: AtomicU64,
    waiters: WaitingList,
}

impl Default for OperationsFreezer {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationsFreezer {
    /// Creates an unfrozen coordinator.
    pub fn new() -> Self {
        Self {
            id: NEXT_FREEZER_ID.fetch_add(1, Ordering::Relaxed),
            operations: ShardedCounter::new(),
            freeze_requests: AtomicI64::new(0),
            params: Mutex::new(HashMap::new()),
            next_freeze_id: AtomicU64::new(1),
            waiters: WaitingList::new(),
        }
    }

    /// Registers the start of a mutating operation.
    ///
    /// Nested calls on one thread register only at the outermost level.
    /// While a freeze is active this blocks until release, or fails with
    /// [`UmbraError::Frozen`] when a fail-fast policy is registered.
    pub fn start_operation(&self) -> Result<()> {
        let nested = OPERATION_DEPTHS.with(|depths| {
            let mut depths = depths.borrow_mut();
            match depths.get_mut(&self.id) {
                Some(depth) => {
                    *depth += 1;
                    true
                }
                None => false,
            }
        });
        if nested {
            return Ok(());
        }

        loop {
            self.operations.increment();
            if self.freeze_requests.load(Ordering::SeqCst) == 0 {
                break;
            }
            // A freeze is active: back the increment out, then fail or wait.
            self.operations.decrement();
            if let Some(policy) = self.fail_fast_policy() {
                return Err(UmbraError::Frozen {
                    reason: policy.reason,
                });
            }
            self.waiters.register(thread::current());
            while self.freeze_requests.load(Ordering::SeqCst) > 0 {
                thread::park();
            }
        }

        OPERATION_DEPTHS.with(|depths| {
            depths.borrow_mut().insert(self.id, 1);
        });
        Ok(())
    }

    /// Registers the end of a mutating operation.
    pub fn end_operation(&self) {
        OPERATION_DEPTHS.with(|depths| {
            let mut depths = depths.borrow_mut();
            let depth = depths.get_mut(&self.id).unwrap_or_else(|| {
                panic!("end_operation called by a thread with no active operation")
            });
            *depth -= 1;
            if *depth == 0 {
                depths.remove(&self.id);
                self.operations.decrement();
            }
        });
    }

    /// Stops new operations and waits for the in-flight ones to drain.
    ///
    /// Returns once no operation that started before this call is still
    /// running. A `policy` makes rejected starters fail fast instead of
    /// blocking. The returned id must be passed to
    /// [`release_operations`](Self::release_operations).
    pub fn freeze_operations(&self, policy: Option<FreezePolicy>) -> FreezeId {
        let freeze_id = self.next_freeze_id.fetch_add(1, Ordering::Relaxed);
        self.params.lock().insert(freeze_id, policy);
        self.freeze_requests.fetch_add(1, Ordering::SeqCst);
        debug!(freeze_id, "freezer.freeze.begin");
        loop {
            let active = self.operations.sum();
            assert!(active >= 0, "operation counter went negative: {active}");
            if active == 0 {
                break;
            }
            thread::yield_now();
        }
        debug!(freeze_id, "freezer.freeze.quiesced");
        freeze_id
    }

    /// Releases one freeze request; the last release wakes every blocked
    /// starter.
    pub fn release_operations(&self, freeze_id: FreezeId) {
        let removed = self.params.lock().remove(&freeze_id);
        assert!(
            removed.is_some(),
            "release_operations called with unknown freeze id {freeze_id}"
        );
        let remaining = self.freeze_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(remaining >= 0, "freeze request counter went negative");
        debug!(freeze_id, remaining, "freezer.freeze.released");
        if remaining == 0 {
            for waiter in self.waiters.cut() {
                waiter.unpark();
            }
        }
    }

    /// Net number of operations currently in flight.
    pub fn operations_count(&self) -> i64 {
        self.operations.sum()
    }

    fn fail_fast_policy(&self) -> Option<FreezePolicy> {
        self.params
            .lock()
            .values()
            .find_map(|policy| policy.clone())
    }
}
