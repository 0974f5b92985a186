//! Core identifiers, the crate-wide error type and `Result` alias.

use std::fmt;

pub mod checksum;

/// Identifier of one paged file inside a storage.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u64);

/// Zero-based index of a fixed-size page inside a paged file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIndex(pub u64);

/// Log sequence number: position identifier in the write-ahead log,
/// strictly increasing across all appended records.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The LSN before any record has been appended.
    pub const ZERO: Lsn = Lsn(0);

    /// Returns the LSN immediately following this one.
    #[must_use]
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

/// Identifier grouping WAL records into one atomic operation unit.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct OperationUnitId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage core.
///
/// Internal-consistency violations (negative counters, premature placement
/// queries, writes into removed slots) are not represented here: they
/// indicate a corrupted core and panic instead of propagating.
#[derive(thiserror::Error, Debug)]
pub enum UmbraError {
    /// An I/O error from the underlying file, propagated unmodified.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data failed a structural or checksum validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument violated the component's contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// New operations are prohibited because a fail-fast freeze is active.
    #[error("operations are frozen: {reason}")]
    Frozen {
        /// Message supplied by the freeze requester.
        reason: String,
    },
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UmbraError>;
