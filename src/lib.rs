//! Durability and concurrency core of the Umbra paginated storage engine.
//!
//! The crate provides the machinery that lets many threads mutate shared,
//! disk-backed pages concurrently while guaranteeing crash-consistent
//! recovery and coordinated quiescence for checkpoints and backups:
//!
//! - [`primitives::spinlock`]: a reader/writer spinlock with a FIFO writer
//!   chain, tuned for short critical sections.
//! - [`primitives::cache`]: the reference-counted, lockable handle over one
//!   cached page buffer.
//! - [`primitives::freeze`]: in-flight operation bookkeeping plus an
//!   administrative freeze/drain barrier.
//! - [`wal`]: the write-ahead log record model, atomic operation units and
//!   the append-only log file they are written to.
//! - [`posmap`]: durable position maps translating logical record
//!   identifiers into physical locations and version counters.
//!
//! Query processing, index algorithms and record semantics live above this
//! crate; they consume pages, locks, operation boundaries and WAL records
//! produced here.

pub mod pagedfile;
pub mod posmap;
pub mod primitives;
pub mod types;
pub mod wal;
