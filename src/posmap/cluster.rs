//! Cluster position map: logical record position to physical placement.
//!
//! Pages after the entry-point page are buckets of packed slots. A slot is
//! 13 bytes: 1 status byte, the 8-byte page index and the 4-byte in-page
//! offset of the record, preceded by the bucket's 4-byte slot count. Slots
//! are never reused or compacted, so a logical position stays valid for the
//! lifetime of the map.

use std::sync::Arc;

use crate::pagedfile::{AtomicOperation, CacheEntry, PagedFile};
use crate::types::{PageIndex, Result, UmbraError};

const COUNT_LEN: usize = 4;
const ENTRY_LEN: usize = 13;

const ENTRY_POINT_MAGIC: [u8; 4] = *b"UCPM";
const ENTRY_POINT_VERSION: u16 = 1;

/// Lifecycle state of one bucket slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    /// The slot was never handed out.
    NotExistent = 0,
    /// The slot held a record that was since removed; terminal.
    Removed = 1,
    /// The slot holds a live placement.
    Filled = 2,
    /// The slot was reserved but not filled yet.
    Allocated = 3,
}

impl SlotStatus {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Removed,
            2 => Self::Filled,
            3 => Self::Allocated,
            _ => Self::NotExistent,
        }
    }
}

/// Physical location of one record: the page it lives in and its byte
/// offset inside that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPlacement {
    /// Page holding the record.
    pub page_index: PageIndex,
    /// Byte offset of the record inside the page.
    pub offset: u32,
}

/// Mutable view over one bucket page.
///
/// Writing into a removed slot panics: removal is terminal, and a caller
/// reaching a removed slot with new data means the map above it lost track
/// of a position.
pub struct Bucket<'a> {
    page: &'a mut [u8],
}

impl<'a> Bucket<'a> {
    /// Wraps a bucket page. The page must fit at least one slot.
    pub fn new(page: &'a mut [u8]) -> Self {
        assert!(
            page.len() >= COUNT_LEN + ENTRY_LEN,
            "bucket page too small for a single slot"
        );
        Self { page }
    }

    /// Number of slots a page of `page_size` bytes can hold.
    pub fn capacity_for(page_size: usize) -> u32 {
        ((page_size - COUNT_LEN) / ENTRY_LEN) as u32
    }

    /// Byte offset of `slot` inside the page.
    pub fn slot_offset(slot: u32) -> usize {
        COUNT_LEN + slot as usize * ENTRY_LEN
    }

    /// Number of slots this bucket can hold.
    pub fn capacity(&self) -> u32 {
        Self::capacity_for(self.page.len())
    }

    /// Number of slots handed out so far, removed ones included.
    pub fn count(&self) -> u32 {
        u32::from_be_bytes(self.page[0..COUNT_LEN].try_into().unwrap_or([0; 4]))
    }

    /// True once every slot has been handed out.
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    /// Status of `slot`; out-of-range slots are [`SlotStatus::NotExistent`].
    pub fn status(&self, slot: u32) -> SlotStatus {
        if slot >= self.count() {
            return SlotStatus::NotExistent;
        }
        SlotStatus::from_byte(self.page[Self::slot_offset(slot)])
    }

    /// Placement stored in `slot`, if the slot is filled.
    pub fn get(&self, slot: u32) -> Option<RecordPlacement> {
        if self.status(slot) != SlotStatus::Filled {
            return None;
        }
        let off = Self::slot_offset(slot);
        Some(RecordPlacement {
            page_index: PageIndex(u64::from_be_bytes(
                self.page[off + 1..off + 9].try_into().unwrap_or([0; 8]),
            )),
            offset: u32::from_be_bytes(
                self.page[off + 9..off + 13].try_into().unwrap_or([0; 4]),
            ),
        })
    }

    /// True when `slot` holds a live placement.
    pub fn exists(&self, slot: u32) -> bool {
        self.status(slot) == SlotStatus::Filled
    }

    /// Hands out the next slot filled with `placement`; `None` when full.
    pub fn add(&mut self, placement: RecordPlacement) -> Option<u32> {
        let slot = self.take_next_slot()?;
        self.write_slot(slot, SlotStatus::Filled, placement);
        Some(slot)
    }

    /// Hands out the next slot as a placeholder; `None` when full.
    pub fn allocate(&mut self) -> Option<u32> {
        let slot = self.take_next_slot()?;
        self.page[Self::slot_offset(slot)] = SlotStatus::Allocated as u8;
        Some(slot)
    }

    /// Fills an allocated or filled slot with `placement`.
    pub fn set(&mut self, slot: u32, placement: RecordPlacement) {
        match self.status(slot) {
            SlotStatus::Allocated | SlotStatus::Filled => {
                self.write_slot(slot, SlotStatus::Filled, placement);
            }
            SlotStatus::Removed => panic!("slot {slot} was removed and cannot be rewritten"),
            SlotStatus::NotExistent => panic!("slot {slot} was never handed out"),
        }
    }

    /// Removes a filled slot, returning its placement. Removal is
    /// terminal; other states return `None` unchanged.
    pub fn remove(&mut self, slot: u32) -> Option<RecordPlacement> {
        let placement = self.get(slot)?;
        self.page[Self::slot_offset(slot)] = SlotStatus::Removed as u8;
        Some(placement)
    }

    fn take_next_slot(&mut self) -> Option<u32> {
        let count = self.count();
        if count == self.capacity() {
            return None;
        }
        self.page[0..COUNT_LEN].copy_from_slice(&(count + 1).to_be_bytes());
        Some(count)
    }

    fn write_slot(&mut self, slot: u32, status: SlotStatus, placement: RecordPlacement) {
        let off = Self::slot_offset(slot);
        self.page[off] = status as u8;
        self.page[off + 1..off + 9].copy_from_slice(&placement.page_index.0.to_be_bytes());
        self.page[off + 9..off + 13].copy_from_slice(&placement.offset.to_be_bytes());
    }
}

/// Durable map from logical record positions to [`RecordPlacement`]s.
///
/// Page 0 of the backing file is the entry-point page; every later page is
/// one bucket. A logical position decomposes into
/// `bucket * capacity + slot`. Mutations must be serialized by the owning
/// component's write lock; reads may run concurrently.
pub struct ClusterPositionMap {
    file: Arc<PagedFile>,
    bucket_capacity: u32,
}

impl ClusterPositionMap {
    /// Initializes the map on an empty paged file, inside `op`.
    pub fn create(file: Arc<PagedFile>, op: &mut AtomicOperation) -> Result<Self> {
        if file.page_count() != 0 {
            return Err(UmbraError::Invalid(
                "cluster position map created over a non-empty file",
            ));
        }
        let entry_point = file.add_page(op)?;
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&ENTRY_POINT_MAGIC);
        header[4..6].copy_from_slice(&ENTRY_POINT_VERSION.to_be_bytes());
        op.update_page(&entry_point, 0, &header)?;
        Ok(Self {
            bucket_capacity: Bucket::capacity_for(file.page_size()),
            file,
        })
    }

    /// Opens an existing map, validating the entry-point page.
    pub fn open(file: Arc<PagedFile>) -> Result<Self> {
        if file.page_count() == 0 {
            return Err(UmbraError::NotFound);
        }
        let entry_point = file.load_page(PageIndex(0))?;
        let guard = entry_point.pointer().acquire_shared_lock();
        if guard[0..4] != ENTRY_POINT_MAGIC {
            return Err(UmbraError::Corruption("cluster position map magic mismatch"));
        }
        let version = u16::from_be_bytes(guard[4..6].try_into().unwrap_or([0; 2]));
        if version != ENTRY_POINT_VERSION {
            return Err(UmbraError::Corruption(
                "cluster position map version mismatch",
            ));
        }
        drop(guard);
        Ok(Self {
            bucket_capacity: Bucket::capacity_for(file.page_size()),
            file,
        })
    }

    /// Opens the map, initializing it first when the file is still empty.
    /// Tolerates storages created before this map existed.
    pub fn open_or_create(file: Arc<PagedFile>, op: &mut AtomicOperation) -> Result<Self> {
        if file.page_count() == 0 {
            Self::create(file, op)
        } else {
            Self::open(file)
        }
    }

    /// Slots per bucket for this map's page size.
    pub fn bucket_capacity(&self) -> u32 {
        self.bucket_capacity
    }

    /// The logical position the next add or allocate will hand out.
    pub fn next_position(&self) -> Result<u64> {
        let buckets = self.file.page_count().saturating_sub(1);
        if buckets == 0 {
            return Ok(0);
        }
        let last = self.load_bucket(buckets - 1)?;
        let mut page = page_copy(&last);
        let bucket = Bucket::new(&mut page);
        Ok((buckets - 1) * u64::from(self.bucket_capacity) + u64::from(bucket.count()))
    }

    /// Adds `placement` at the next logical position.
    pub fn add(&self, op: &mut AtomicOperation, placement: RecordPlacement) -> Result<u64> {
        self.append_slot(op, Some(placement))
    }

    /// Reserves the next logical position without a placement.
    pub fn allocate(&self, op: &mut AtomicOperation) -> Result<u64> {
        self.append_slot(op, None)
    }

    /// Fills the slot at `position` with `placement`.
    pub fn set(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        placement: RecordPlacement,
    ) -> Result<()> {
        let (entry, slot) = self.locate(position)?;
        let mut page = page_copy(&entry);
        Bucket::new(&mut page).set(slot, placement);
        self.write_back_slot(op, &entry, &page, slot)
    }

    /// Removes the record at `position`, returning its placement.
    pub fn remove(
        &self,
        op: &mut AtomicOperation,
        position: u64,
    ) -> Result<Option<RecordPlacement>> {
        let (entry, slot) = self.locate(position)?;
        let mut page = page_copy(&entry);
        let removed = Bucket::new(&mut page).remove(slot);
        if removed.is_some() {
            self.write_back_slot(op, &entry, &page, slot)?;
        }
        Ok(removed)
    }

    /// Placement of the record at `position`, if it is filled.
    pub fn get(&self, position: u64) -> Result<Option<RecordPlacement>> {
        let Some((entry, slot)) = self.try_locate(position)? else {
            return Ok(None);
        };
        let mut page = page_copy(&entry);
        Ok(Bucket::new(&mut page).get(slot))
    }

    /// True when the record at `position` is filled.
    pub fn exists(&self, position: u64) -> Result<bool> {
        Ok(self.get(position)?.is_some())
    }

    fn append_slot(
        &self,
        op: &mut AtomicOperation,
        placement: Option<RecordPlacement>,
    ) -> Result<u64> {
        let buckets = self.file.page_count().saturating_sub(1);
        let (entry, bucket_index) = match buckets.checked_sub(1) {
            Some(last) => {
                let entry = self.load_bucket(last)?;
                let mut page = page_copy(&entry);
                if Bucket::new(&mut page).is_full() {
                    (self.file.add_page(op)?, buckets)
                } else {
                    (entry, last)
                }
            }
            None => (self.file.add_page(op)?, 0),
        };

        let mut page = page_copy(&entry);
        let mut bucket = Bucket::new(&mut page);
        let slot = match placement {
            Some(placement) => bucket.add(placement),
            None => bucket.allocate(),
        }
        .ok_or(UmbraError::Invalid("bucket overflowed during append"))?;

        op.update_page(&entry, 0, &page[0..COUNT_LEN])?;
        self.write_back_slot(op, &entry, &page, slot)?;
        Ok(bucket_index * u64::from(self.bucket_capacity) + u64::from(slot))
    }

    fn write_back_slot(
        &self,
        op: &mut AtomicOperation,
        entry: &CacheEntry,
        page: &[u8],
        slot: u32,
    ) -> Result<()> {
        let off = Bucket::slot_offset(slot);
        op.update_page(entry, off as u32, &page[off..off + ENTRY_LEN])?;
        Ok(())
    }

    fn locate(&self, position: u64) -> Result<(CacheEntry, u32)> {
        self.try_locate(position)?.ok_or(UmbraError::NotFound)
    }

    fn try_locate(&self, position: u64) -> Result<Option<(CacheEntry, u32)>> {
        let bucket_index = position / u64::from(self.bucket_capacity);
        let slot = (position % u64::from(self.bucket_capacity)) as u32;
        if bucket_index + 1 >= self.file.page_count() {
            return Ok(None);
        }
        Ok(Some((self.load_bucket(bucket_index)?, slot)))
    }

    fn load_bucket(&self, bucket_index: u64) -> Result<CacheEntry> {
        self.file.load_page(PageIndex(bucket_index + 1))
    }
}

fn page_copy(entry: &CacheEntry) -> Vec<u8> {
    entry.pointer().acquire_shared_lock().to_vec()
}
