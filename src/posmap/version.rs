//! Version position map: per-key-bucket modification counters used for
//! optimistic conflict detection.

use std::sync::Arc;

use crate::pagedfile::{AtomicOperation, CacheEntry, PagedFile};
use crate::types::{PageIndex, Result, UmbraError};

const ENTRY_POINT_MAGIC: [u8; 4] = *b"UVPM";
const ENTRY_POINT_VERSION: u16 = 1;
const COUNTER_LEN: usize = 8;

/// Maps a key to its version bucket in `[0, buckets)`.
///
/// FNV-1a, spelled out rather than pulled from a hashing crate: the hash
/// participates in the durable placement of counters, so it must never
/// drift with a dependency upgrade. Collisions are expected and harmless;
/// a collision only makes two keys share a conflict counter.
pub fn key_hash(key: &[u8], buckets: u64) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = OFFSET_BASIS;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash % buckets
}

/// Durable array of `u64` modification counters, one per key bucket.
///
/// Page 0 of the backing file is the entry-point page recording the bucket
/// count; counters are packed big-endian across the following pages.
/// Counters only ever grow. Mutations must be serialized by the owning
/// component's write lock; reads may run concurrently.
pub struct VersionPositionMap {
    file: Arc<PagedFile>,
    buckets: u64,
}

impl VersionPositionMap {
    /// Initializes the map with `buckets` counters on an empty paged file.
    pub fn create(file: Arc<PagedFile>, op: &mut AtomicOperation, buckets: u64) -> Result<Self> {
        if file.page_count() != 0 {
            return Err(UmbraError::Invalid(
                "version position map created over a non-empty file",
            ));
        }
        if buckets == 0 {
            return Err(UmbraError::Invalid("version position map needs buckets"));
        }
        let entry_point = file.add_page(op)?;
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&ENTRY_POINT_MAGIC);
        header[4..6].copy_from_slice(&ENTRY_POINT_VERSION.to_be_bytes());
        header[8..16].copy_from_slice(&buckets.to_be_bytes());
        op.update_page(&entry_point, 0, &header)?;

        // Counter pages start zeroed, which is exactly version 0 everywhere.
        let counters_per_page = (file.page_size() / COUNTER_LEN) as u64;
        let counter_pages = buckets.div_ceil(counters_per_page);
        for _ in 0..counter_pages {
            file.add_page(op)?;
        }
        Ok(Self { file, buckets })
    }

    /// Opens an existing map, validating the entry-point page.
    pub fn open(file: Arc<PagedFile>) -> Result<Self> {
        if file.page_count() == 0 {
            return Err(UmbraError::NotFound);
        }
        let entry_point = file.load_page(PageIndex(0))?;
        let guard = entry_point.pointer().acquire_shared_lock();
        if guard[0..4] != ENTRY_POINT_MAGIC {
            return Err(UmbraError::Corruption("version position map magic mismatch"));
        }
        let version = u16::from_be_bytes(guard[4..6].try_into().unwrap_or([0; 2]));
        if version != ENTRY_POINT_VERSION {
            return Err(UmbraError::Corruption(
                "version position map version mismatch",
            ));
        }
        let buckets = u64::from_be_bytes(guard[8..16].try_into().unwrap_or([0; 8]));
        drop(guard);
        if buckets == 0 {
            return Err(UmbraError::Corruption("version position map has no buckets"));
        }
        Ok(Self { file, buckets })
    }

    /// Opens the map, initializing it with `buckets` counters when the
    /// file is still empty. Tolerates storages created before this map
    /// existed; the stored bucket count wins over `buckets` on open.
    pub fn open_or_create(
        file: Arc<PagedFile>,
        op: &mut AtomicOperation,
        buckets: u64,
    ) -> Result<Self> {
        if file.page_count() == 0 {
            Self::create(file, op, buckets)
        } else {
            Self::open(file)
        }
    }

    /// Number of version buckets.
    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    /// Bucket for `key`, using this map's bucket count.
    pub fn bucket_for(&self, key: &[u8]) -> u64 {
        key_hash(key, self.buckets)
    }

    /// Increments the counter of `bucket` inside `op`, returning the new
    /// value.
    pub fn update_version(&self, op: &mut AtomicOperation, bucket: u64) -> Result<u64> {
        let (entry, offset) = self.locate(bucket)?;
        let current = read_counter(&entry, offset);
        let next = current
            .checked_add(1)
            .ok_or(UmbraError::Corruption("version counter overflowed"))?;
        op.update_page(&entry, offset as u32, &next.to_be_bytes())?;
        Ok(next)
    }

    /// Current counter value of `bucket`.
    pub fn get_version(&self, bucket: u64) -> Result<u64> {
        let (entry, offset) = self.locate(bucket)?;
        Ok(read_counter(&entry, offset))
    }

    fn locate(&self, bucket: u64) -> Result<(CacheEntry, usize)> {
        if bucket >= self.buckets {
            return Err(UmbraError::Invalid("version bucket out of range"));
        }
        let counters_per_page = (self.file.page_size() / COUNTER_LEN) as u64;
        let page = PageIndex(1 + bucket / counters_per_page);
        let offset = (bucket % counters_per_page) as usize * COUNTER_LEN;
        Ok((self.file.load_page(page)?, offset))
    }
}

fn read_counter(entry: &CacheEntry, offset: usize) -> u64 {
    let guard = entry.pointer().acquire_shared_lock();
    u64::from_be_bytes(
        guard[offset..offset + COUNTER_LEN]
            .try_into()
            .unwrap_or([0; COUNTER_LEN]),
    )
}
