//! Low-level primitives the durability core is built from.
//!
//! Includes positioned file I/O, the reader/writer spinlock, the cached
//! page handle and buffer pool, and the operation-freeze coordinator.

/// Cached page buffers: the pool allocator and the reference-counted,
/// lockable page handle shared between concurrent page accesses.
pub mod cache;

/// Sharded counters used by the spinlock and the operations freezer.
pub mod counter;

/// Operation bookkeeping and the administrative freeze/drain barrier.
pub mod freeze;

/// Positioned file I/O abstractions.
pub mod io;

/// Reader/writer spinlock optimized for short critical sections.
pub mod spinlock;
