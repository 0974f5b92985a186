//! Checksums guarding WAL frames against torn writes and bit rot.

#![forbid(unsafe_code)]

use crate::types::Lsn;

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum over everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) implementation backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum over one WAL record frame. Mixing in the LSN catches a frame
/// that was written whole but at the wrong log position.
pub fn record_crc32(lsn: Lsn, payload: &[u8]) -> u32 {
    let mut checksum = Crc32Fast::default();
    checksum.update(&lsn.0.to_be_bytes());
    checksum.update(payload);
    checksum.finalize()
}

/// Checksum over a raw byte buffer, used for file headers.
pub fn buffer_crc32(bytes: &[u8]) -> u32 {
    let mut checksum = Crc32Fast::default();
    checksum.update(bytes);
    checksum.finalize()
}
