//! Sharded counter used on paths that execute on every page touch.
//!
//! Increments and decrements land on a per-thread shard so concurrent
//! callers do not contend on one cache line; only the rare drain check
//! (writer admission, freeze quiescence) pays for a full sum.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

const SHARD_COUNT: usize = 32;

#[repr(align(64))]
#[derive(Default)]
struct Shard {
    value: AtomicI64,
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_SLOT: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
}

/// A counter distributed over cache-line-padded shards.
///
/// The sum may be transiently stale while mutations are in flight, but a
/// quiescent counter (no concurrent mutators) always sums exactly.
pub struct ShardedCounter {
    shards: Box<[Shard]>,
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedCounter {
    /// Creates a zeroed counter.
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, Shard::default);
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Adds `delta` on the calling thread's shard.
    ///
    /// Sequentially consistent: callers pair an increment here with a load
    /// of a separate admission flag, and the drain side pairs a flag store
    /// with `sum()`. The total order guarantees at least one side observes
    /// the other.
    pub fn add(&self, delta: i64) {
        let slot = SHARD_SLOT.with(|s| *s);
        self.shards[slot].value.fetch_add(delta, Ordering::SeqCst);
    }

    /// Increments the calling thread's shard.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Decrements the calling thread's shard.
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Sums every shard.
    pub fn sum(&self) -> i64 {
        self.shards
            .iter()
            .map(|shard| shard.value.load(Ordering::SeqCst))
            .sum()
    }
}
