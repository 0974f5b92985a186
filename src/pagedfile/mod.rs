//! Fixed-size paged files backed by pooled, reference-counted page handles,
//! and the atomic operation context that frames their mutations in the WAL.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::cache::{CachePointer, PageBufferPool};
use crate::primitives::freeze::OperationsFreezer;
use crate::primitives::io::FileIo;
use crate::types::{FileId, Lsn, OperationUnitId, PageIndex, Result, UmbraError};
use crate::wal::{RecordPayload, WalLog, WalRecord};

/// Referrer-managed handle to one cached page.
///
/// Creation takes a referrer on the underlying [`CachePointer`]; dropping
/// the entry releases it. Clones are independent referrers.
pub struct CacheEntry {
    pointer: Arc<CachePointer>,
}

impl CacheEntry {
    fn new(pointer: Arc<CachePointer>) -> Self {
        pointer.increment_referrer();
        Self { pointer }
    }

    /// The shared pointer this entry refers to.
    pub fn pointer(&self) -> &Arc<CachePointer> {
        &self.pointer
    }

    /// Index of the page inside its file.
    pub fn page_index(&self) -> PageIndex {
        self.pointer.page_index()
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.pointer))
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.pointer.decrement_referrer();
    }
}

/// One file divided into fixed-size pages, each accessed through a cached
/// [`CachePointer`].
///
/// The cache holds one persistent referrer per resident page, so buffers
/// stay alive between accesses and return to the pool only when the file
/// is closed.
pub struct PagedFile {
    file_id: FileId,
    io: Arc<dyn FileIo>,
    pool: Arc<PageBufferPool>,
    pages: Mutex<HashMap<PageIndex, Arc<CachePointer>>>,
    page_count: AtomicU64,
}

impl PagedFile {
    /// Opens a paged file over `io`. The file length must be a whole
    /// number of pages.
    pub fn open(io: Arc<dyn FileIo>, file_id: FileId, pool: Arc<PageBufferPool>) -> Result<Self> {
        let len = io.len()?;
        let page_size = pool.page_size() as u64;
        if len % page_size != 0 {
            return Err(UmbraError::Corruption(
                "paged file length is not a whole number of pages",
            ));
        }
        Ok(Self {
            file_id,
            io,
            pool,
            pages: Mutex::new(HashMap::new()),
            page_count: AtomicU64::new(len / page_size),
        })
    }

    /// Identifier of this file.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Number of pages currently in the file.
    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Loads a page into the cache (or finds it there) and returns a
    /// referrer-managed handle to it.
    pub fn load_page(&self, index: PageIndex) -> Result<CacheEntry> {
        if index.0 >= self.page_count() {
            return Err(UmbraError::NotFound);
        }
        let mut pages = self.pages.lock();
        if let Some(pointer) = pages.get(&index) {
            return Ok(CacheEntry::new(Arc::clone(pointer)));
        }
        let mut buffer = self.pool.acquire();
        self.io
            .read_at(index.0 * self.page_size() as u64, &mut buffer)?;
        let pointer = Arc::new(CachePointer::new(
            Arc::clone(&self.pool),
            buffer,
            self.file_id,
            index,
        ));
        // The cache's own referrer keeps the buffer resident between
        // accesses.
        pointer.increment_referrer();
        pages.insert(index, Arc::clone(&pointer));
        Ok(CacheEntry::new(pointer))
    }

    /// Appends a zeroed page to the file inside `op` and returns a handle
    /// to it.
    pub fn add_page(&self, op: &mut AtomicOperation) -> Result<CacheEntry> {
        let mut pages = self.pages.lock();
        let index = PageIndex(self.page_count.load(Ordering::SeqCst));

        // Reserve the page on disk first: a failed write must leave the
        // page count and the cache agreeing with the file length.
        let zeros = vec![0u8; self.page_size()];
        self.io.write_at(index.0 * self.page_size() as u64, &zeros)?;

        let buffer = self.pool.acquire();
        let pointer = Arc::new(CachePointer::new(
            Arc::clone(&self.pool),
            buffer,
            self.file_id,
            index,
        ));
        pointer.increment_referrer();
        pages.insert(index, Arc::clone(&pointer));
        self.page_count.store(index.0 + 1, Ordering::SeqCst);
        drop(pages);

        let entry = CacheEntry::new(pointer);
        // A length-zero update records the page's creation in the unit.
        op.update_page(&entry, 0, &[])?;
        debug!(
            file_id = self.file_id.0,
            page_index = index.0,
            "pagedfile.page.added"
        );
        Ok(entry)
    }

    /// Copies a page's current content into a fresh vector.
    pub fn read_page(&self, index: PageIndex) -> Result<Vec<u8>> {
        let entry = self.load_page(index)?;
        let guard = entry.pointer().acquire_shared_lock();
        Ok(guard.to_vec())
    }

    /// Writes every cached page back to disk and syncs the file.
    ///
    /// Callers must sync the WAL first: a page may not reach disk before
    /// the records describing its changes.
    pub fn flush(&self) -> Result<()> {
        let snapshot: Vec<(PageIndex, Arc<CachePointer>)> = self
            .pages
            .lock()
            .iter()
            .map(|(index, pointer)| (*index, Arc::clone(pointer)))
            .collect();
        for (index, pointer) in snapshot {
            let guard = pointer.acquire_shared_lock();
            self.io
                .write_at(index.0 * self.page_size() as u64, &guard)?;
        }
        self.io.sync_all()?;
        debug!(file_id = self.file_id.0, "pagedfile.flushed");
        Ok(())
    }

    /// Evicts every cached page, returning their buffers to the pool.
    ///
    /// Outstanding [`CacheEntry`] handles keep their pages alive until
    /// dropped.
    pub fn close(&self) {
        let pages = std::mem::take(&mut *self.pages.lock());
        for pointer in pages.into_values() {
            pointer.decrement_referrer();
        }
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`AtomicOperation`]s, tying the shared WAL and freezer
/// together.
pub struct AtomicOperationsManager {
    log: Arc<WalLog>,
    freezer: Arc<OperationsFreezer>,
    next_unit_id: AtomicU64,
}

impl AtomicOperationsManager {
    /// Creates a manager over the given log and freezer.
    pub fn new(log: Arc<WalLog>, freezer: Arc<OperationsFreezer>) -> Self {
        Self {
            log,
            freezer,
            next_unit_id: AtomicU64::new(1),
        }
    }

    /// The log units append to.
    pub fn log(&self) -> &Arc<WalLog> {
        &self.log
    }

    /// The freezer units register with.
    pub fn freezer(&self) -> &Arc<OperationsFreezer> {
        &self.freezer
    }

    /// Starts a new atomic operation unit.
    ///
    /// Registers with the freezer (blocking or failing fast while a freeze
    /// holds) and appends the unit's start record before returning.
    pub fn begin(&self, has_undo: bool) -> Result<AtomicOperation> {
        self.freezer.start_operation()?;
        let unit_id = OperationUnitId(self.next_unit_id.fetch_add(1, Ordering::Relaxed));
        let mut start = WalRecord::new(RecordPayload::AtomicUnitStart { unit_id, has_undo });
        if let Err(err) = self.log.append(&mut start) {
            self.freezer.end_operation();
            return Err(err);
        }
        Ok(AtomicOperation {
            log: Arc::clone(&self.log),
            freezer: Arc::clone(&self.freezer),
            unit_id,
            finished: false,
        })
    }
}

/// One atomic operation unit: a WAL-framed group of page mutations.
///
/// Ends with [`commit`](Self::commit) or [`rollback`](Self::rollback);
/// dropping an unfinished unit leaves no end record in the log, which is
/// exactly what recovery classifies as "must be undone".
pub struct AtomicOperation {
    log: Arc<WalLog>,
    freezer: Arc<OperationsFreezer>,
    unit_id: OperationUnitId,
    finished: bool,
}

impl AtomicOperation {
    /// Identifier of this unit in the log.
    pub fn unit_id(&self) -> OperationUnitId {
        self.unit_id
    }

    /// Writes `data` into the page at `offset` under its exclusive content
    /// lock, logs the mutation and advances the page's end LSN.
    pub fn update_page(&mut self, entry: &CacheEntry, offset: u32, data: &[u8]) -> Result<Lsn> {
        let pointer = entry.pointer();
        let mut guard = pointer.acquire_exclusive_lock();
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or(UmbraError::Invalid("page update range overflows"))?;
        if end > guard.len() {
            return Err(UmbraError::Invalid("page update exceeds the page size"));
        }
        guard[start..end].copy_from_slice(data);

        let mut record = WalRecord::new(RecordPayload::PageUpdate {
            unit_id: self.unit_id,
            file_id: pointer.file_id(),
            page_index: pointer.page_index(),
            offset,
            data: data.to_vec(),
        });
        let lsn = self.log.append(&mut record)?;
        pointer.set_end_lsn(lsn);
        Ok(lsn)
    }

    /// Logs a mutation performed outside atomic-unit framing.
    pub fn mark_non_tx_operation(&mut self) -> Result<Lsn> {
        let mut record = WalRecord::new(RecordPayload::NonTxOperationPerformed);
        self.log.append(&mut record)
    }

    /// Closes the unit as committed.
    pub fn commit(mut self) -> Result<Lsn> {
        self.finish(false)
    }

    /// Closes the unit as rolled back.
    pub fn rollback(mut self) -> Result<Lsn> {
        self.finish(true)
    }

    fn finish(&mut self, rollback: bool) -> Result<Lsn> {
        let mut end = WalRecord::new(RecordPayload::AtomicUnitEnd {
            unit_id: self.unit_id,
            rollback,
        });
        let lsn = self.log.append(&mut end)?;
        self.finished = true;
        self.freezer.end_operation();
        debug!(
            unit_id = self.unit_id.0,
            rollback, "atomic_operation.finished"
        );
        Ok(lsn)
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.finished {
            self.freezer.end_operation();
        }
    }
}
