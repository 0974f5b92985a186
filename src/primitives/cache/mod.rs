//! Pooled page buffers and the reference-counted handle that shares one
//! cached page between concurrent accesses.

#![forbid(unsafe_code)]

use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::types::{FileId, Lsn, PageIndex};

/// One page worth of raw bytes, owned by the pool between uses.
pub type PageBuffer = Box<[u8]>;

/// Allocator for fixed-size page buffers.
///
/// Buffers leave the pool when a [`CachePointer`] is created over them and
/// return exactly once, when the pointer's referrer count reaches zero.
pub struct PageBufferPool {
    page_size: usize,
    free: Mutex<Vec<PageBuffer>>,
}

impl PageBufferPool {
    /// Creates a pool handing out buffers of `page_size` bytes.
    pub fn new(page_size: usize) -> Arc<Self> {
        assert!(page_size > 0, "page size must be non-zero");
        Arc::new(Self {
            page_size,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Page size of every buffer in this pool.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Takes a zeroed buffer from the free list, allocating when empty.
    pub fn acquire(&self) -> PageBuffer {
        match self.free.lock().pop() {
            Some(mut buffer) => {
                buffer.fill(0);
                buffer
            }
            None => vec![0u8; self.page_size].into_boxed_slice(),
        }
    }

    /// Returns a buffer to the free list.
    pub fn release(&self, buffer: PageBuffer) {
        assert_eq!(
            buffer.len(),
            self.page_size,
            "buffer returned to a pool with a different page size"
        );
        self.free.lock().push(buffer);
    }

    /// Number of buffers currently resting in the free list.
    pub fn free_buffers(&self) -> usize {
        self.free.lock().len()
    }
}

/// Observer of the packed readers/writers counters.
///
/// Fires exactly at the two transition edges of the predicate
/// "writers present and no readers": write-back scheduling uses the edges
/// to learn which pages can be flushed without reader interference.
pub trait WritersListener: Send + Sync {
    /// The page now has writers and zero readers.
    fn writers_without_readers(&self, file_id: FileId, page_index: PageIndex);
    /// Readers arrived (or writers left) on a page that was flush-eligible.
    fn readers_returned(&self, file_id: FileId, page_index: PageIndex);
}

const READERS_MASK: u64 = 0xFFFF_FFFF;

fn pack(readers: u32, writers: u32) -> u64 {
    (u64::from(writers) << 32) | u64::from(readers)
}

fn unpack(word: u64) -> (u32, u32) {
    ((word & READERS_MASK) as u32, (word >> 32) as u32)
}

fn flush_eligible(readers: u32, writers: u32) -> bool {
    writers > 0 && readers == 0
}

/// Reference-counted, lockable handle over one cached page buffer.
///
/// Identity, equality and hashing are by `(file_id, page_index)`. The
/// readers/writers pair lives in one atomically updated word so a single
/// CAS adjusts both counters and decides listener edges without races; the
/// content lock is a true blocking reader/writer lock because page content
/// access can be I/O-bound.
pub struct CachePointer {
    file_id: FileId,
    page_index: PageIndex,
    pool: Arc<PageBufferPool>,
    content: Arc<RwLock<Option<PageBuffer>>>,
    referrers: AtomicI64,
    readers_writers: AtomicU64,
    version: AtomicU64,
    end_lsn: AtomicU64,
    listener: Mutex<Option<Arc<dyn WritersListener>>>,
}

impl CachePointer {
    /// Wraps `buffer` (previously acquired from `pool`) for the given page.
    pub fn new(
        pool: Arc<PageBufferPool>,
        buffer: PageBuffer,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Self {
        assert_eq!(
            buffer.len(),
            pool.page_size(),
            "buffer does not match the pool page size"
        );
        Self {
            file_id,
            page_index,
            pool,
            content: Arc::new(RwLock::new(Some(buffer))),
            referrers: AtomicI64::new(0),
            readers_writers: AtomicU64::new(0),
            version: AtomicU64::new(0),
            end_lsn: AtomicU64::new(0),
            listener: Mutex::new(None),
        }
    }

    /// File this page belongs to.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Index of this page inside its file.
    pub fn page_index(&self) -> PageIndex {
        self.page_index
    }

    /// Registers the listener notified at the readers/writers edges.
    pub fn set_writers_listener(&self, listener: Arc<dyn WritersListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Adds one referrer keeping the buffer alive.
    pub fn increment_referrer(&self) {
        self.referrers.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one referrer; the buffer returns to the pool exactly when the
    /// count reaches zero. A negative count panics.
    pub fn decrement_referrer(&self) {
        let remaining = self.referrers.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(
            remaining >= 0,
            "referrer count of page ({}, {}) went negative",
            self.file_id,
            self.page_index
        );
        if remaining == 0 {
            let buffer = self
                .content
                .write()
                .take()
                .expect("page buffer released twice");
            self.pool.release(buffer);
        }
    }

    /// Current number of referrers.
    pub fn referrers(&self) -> i64 {
        self.referrers.load(Ordering::SeqCst)
    }

    /// Registers a reader on this page; also takes a referrer.
    pub fn increment_readers_referrer(&self) {
        self.update_counters(1, 0);
        self.increment_referrer();
    }

    /// Removes a reader; also drops a referrer.
    pub fn decrement_readers_referrer(&self) {
        self.update_counters(-1, 0);
        self.decrement_referrer();
    }

    /// Registers a writer on this page; also takes a referrer.
    pub fn increment_writers_referrer(&self) {
        self.update_counters(0, 1);
        self.increment_referrer();
    }

    /// Removes a writer; also drops a referrer.
    pub fn decrement_writers_referrer(&self) {
        self.update_counters(0, -1);
        self.decrement_referrer();
    }

    /// Current `(readers, writers)` pair, read atomically.
    pub fn readers_writers(&self) -> (u32, u32) {
        unpack(self.readers_writers.load(Ordering::SeqCst))
    }

    fn update_counters(&self, reader_delta: i64, writer_delta: i64) {
        let mut current = self.readers_writers.load(Ordering::SeqCst);
        loop {
            let (readers, writers) = unpack(current);
            let new_readers = i64::from(readers) + reader_delta;
            let new_writers = i64::from(writers) + writer_delta;
            assert!(
                new_readers >= 0 && new_writers >= 0,
                "reader/writer count of page ({}, {}) went negative",
                self.file_id,
                self.page_index
            );
            let new_readers = new_readers as u32;
            let new_writers = new_writers as u32;
            match self.readers_writers.compare_exchange(
                current,
                pack(new_readers, new_writers),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let was_eligible = flush_eligible(readers, writers);
                    let now_eligible = flush_eligible(new_readers, new_writers);
                    if was_eligible != now_eligible {
                        if let Some(listener) = self.listener.lock().clone() {
                            if now_eligible {
                                listener.writers_without_readers(self.file_id, self.page_index);
                            } else {
                                listener.readers_returned(self.file_id, self.page_index);
                            }
                        }
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Acquires the content lock exclusively and bumps the page version.
    pub fn acquire_exclusive_lock(&self) -> PageWriteGuard {
        let guard = self.content.write_arc();
        self.version.fetch_add(1, Ordering::SeqCst);
        PageWriteGuard { guard }
    }

    /// Acquires the content lock in shared mode.
    pub fn acquire_shared_lock(&self) -> PageReadGuard {
        PageReadGuard {
            guard: self.content.read_arc(),
        }
    }

    /// Attempts to acquire the content lock in shared mode without
    /// blocking.
    pub fn try_acquire_shared_lock(&self) -> Option<PageReadGuard> {
        self.content
            .try_read_arc()
            .map(|guard| PageReadGuard { guard })
    }

    /// Page version; increments only under the exclusive content lock, so
    /// it is monotonically non-decreasing and usable for optimistic
    /// validation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Highest LSN known durable for this page.
    pub fn end_lsn(&self) -> Lsn {
        Lsn(self.end_lsn.load(Ordering::SeqCst))
    }

    /// Records a new highest durable LSN for this page.
    pub fn set_end_lsn(&self, lsn: Lsn) {
        self.end_lsn.store(lsn.0, Ordering::SeqCst);
    }
}

impl PartialEq for CachePointer {
    fn eq(&self, other: &Self) -> bool {
        self.file_id == other.file_id && self.page_index == other.page_index
    }
}

impl Eq for CachePointer {}

impl Hash for CachePointer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_id.hash(state);
        self.page_index.hash(state);
    }
}

/// Exclusive guard over a page's content.
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Option<PageBuffer>>,
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard
            .as_deref()
            .expect("page buffer accessed after release")
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard
            .as_deref_mut()
            .expect("page buffer accessed after release")
    }
}

/// Shared guard over a page's content.
pub struct PageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Option<PageBuffer>>,
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard
            .as_deref()
            .expect("page buffer accessed after release")
    }
}
