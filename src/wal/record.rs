//! The structural contract every durable log entry implements: identity,
//! physical-layout metadata and grouping into atomic operation units.
//!
//! The binary layout is part of the durable format: one type-tag byte,
//! then, for operation-unit subtypes, the 8-byte unit id first, then the
//! type-specific fields, all big-endian. Cross-version log replay depends
//! on this ordering and on the field widths staying fixed.

use bytes::{Buf, BufMut};

use crate::types::{FileId, Lsn, OperationUnitId, PageIndex, Result, UmbraError};

/// Discriminant written as the first byte of every serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Opens an atomic operation unit.
    AtomicUnitStart = 1,
    /// Closes an atomic operation unit (commit or rollback).
    AtomicUnitEnd = 2,
    /// A mutation of exactly one page inside a unit.
    PageUpdate = 3,
    /// A mutation intentionally performed outside atomic-unit framing.
    NonTxOperationPerformed = 4,
}

impl RecordType {
    /// Parses the type tag; `None` for unknown bytes.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::AtomicUnitStart),
            2 => Some(Self::AtomicUnitEnd),
            3 => Some(Self::PageUpdate),
            4 => Some(Self::NonTxOperationPerformed),
            _ => None,
        }
    }

    /// The on-disk tag byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Typed payload of one WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    /// Marks an atomic unit's beginning and whether undo information
    /// exists for it.
    AtomicUnitStart {
        /// Unit this record opens.
        unit_id: OperationUnitId,
        /// Whether undo information was captured for the unit.
        has_undo: bool,
    },
    /// Closes an atomic unit. The start/end pairing is recovery's
    /// definition of "completed" versus "must be undone".
    AtomicUnitEnd {
        /// Unit this record closes.
        unit_id: OperationUnitId,
        /// True when the unit was rolled back rather than committed.
        rollback: bool,
    },
    /// A mutation of one page, replayable without re-deriving the target
    /// from higher-level semantics.
    PageUpdate {
        /// Unit the mutation belongs to.
        unit_id: OperationUnitId,
        /// File of the mutated page.
        file_id: FileId,
        /// Index of the mutated page.
        page_index: PageIndex,
        /// Byte offset of the change inside the page.
        offset: u32,
        /// Bytes written at `offset`.
        data: Vec<u8>,
    },
    /// Marker for a mutation outside atomic-unit framing; recovery treats
    /// it as always applied.
    NonTxOperationPerformed,
}

impl RecordPayload {
    /// The type tag this payload serializes under.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::AtomicUnitStart { .. } => RecordType::AtomicUnitStart,
            Self::AtomicUnitEnd { .. } => RecordType::AtomicUnitEnd,
            Self::PageUpdate { .. } => RecordType::PageUpdate,
            Self::NonTxOperationPerformed => RecordType::NonTxOperationPerformed,
        }
    }

    /// Unit id for operation-unit subtypes, `None` for standalone markers.
    pub fn operation_unit_id(&self) -> Option<OperationUnitId> {
        match self {
            Self::AtomicUnitStart { unit_id, .. }
            | Self::AtomicUnitEnd { unit_id, .. }
            | Self::PageUpdate { unit_id, .. } => Some(*unit_id),
            Self::NonTxOperationPerformed => None,
        }
    }

    /// Exact number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Self::AtomicUnitStart { .. } => 8 + 1,
            Self::AtomicUnitEnd { .. } => 8 + 1,
            Self::PageUpdate { data, .. } => 8 + 8 + 8 + 4 + 4 + data.len(),
            Self::NonTxOperationPerformed => 0,
        }
    }

    /// Appends the fixed-order binary form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.record_type().as_byte());
        match self {
            Self::AtomicUnitStart { unit_id, has_undo } => {
                buf.put_u64(unit_id.0);
                buf.put_u8(u8::from(*has_undo));
            }
            Self::AtomicUnitEnd { unit_id, rollback } => {
                buf.put_u64(unit_id.0);
                buf.put_u8(u8::from(*rollback));
            }
            Self::PageUpdate {
                unit_id,
                file_id,
                page_index,
                offset,
                data,
            } => {
                buf.put_u64(unit_id.0);
                buf.put_u64(file_id.0);
                buf.put_u64(page_index.0);
                buf.put_u32(*offset);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Self::NonTxOperationPerformed => {}
        }
    }

    /// Decodes a payload produced by [`encode`](Self::encode), rejecting
    /// truncated input and trailing bytes.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut cur = src;
        if cur.remaining() < 1 {
            return Err(UmbraError::Corruption("wal record payload is empty"));
        }
        let tag = cur.get_u8();
        let record_type = RecordType::from_byte(tag)
            .ok_or(UmbraError::Corruption("unknown wal record type"))?;
        let payload = match record_type {
            RecordType::AtomicUnitStart => {
                if cur.remaining() < 9 {
                    return Err(UmbraError::Corruption("truncated atomic unit start"));
                }
                let unit_id = OperationUnitId(cur.get_u64());
                let has_undo = cur.get_u8() != 0;
                Self::AtomicUnitStart { unit_id, has_undo }
            }
            RecordType::AtomicUnitEnd => {
                if cur.remaining() < 9 {
                    return Err(UmbraError::Corruption("truncated atomic unit end"));
                }
                let unit_id = OperationUnitId(cur.get_u64());
                let rollback = cur.get_u8() != 0;
                Self::AtomicUnitEnd { unit_id, rollback }
            }
            RecordType::PageUpdate => {
                if cur.remaining() < 32 {
                    return Err(UmbraError::Corruption("truncated page update header"));
                }
                let unit_id = OperationUnitId(cur.get_u64());
                let file_id = FileId(cur.get_u64());
                let page_index = PageIndex(cur.get_u64());
                let offset = cur.get_u32();
                let len = cur.get_u32() as usize;
                if cur.remaining() < len {
                    return Err(UmbraError::Corruption("truncated page update data"));
                }
                let data = cur[..len].to_vec();
                cur.advance(len);
                Self::PageUpdate {
                    unit_id,
                    file_id,
                    page_index,
                    offset,
                    data,
                }
            }
            RecordType::NonTxOperationPerformed => Self::NonTxOperationPerformed,
        };
        if cur.has_remaining() {
            return Err(UmbraError::Corruption("trailing bytes in wal record"));
        }
        Ok(payload)
    }
}

/// One durable log entry.
///
/// LSN and placement metadata (distance to the previous record, on-disk
/// size) exist only once the record has been appended to a log; querying
/// them earlier panics: it means recovery code read positioning metadata
/// prematurely. The `written` flag is one-way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    payload: RecordPayload,
    lsn: Option<Lsn>,
    distance_to_prev: Option<u64>,
    disk_size: Option<u32>,
    written: bool,
}

impl WalRecord {
    /// Wraps a payload that has not been appended yet.
    pub fn new(payload: RecordPayload) -> Self {
        Self {
            payload,
            lsn: None,
            distance_to_prev: None,
            disk_size: None,
            written: false,
        }
    }

    /// The typed payload.
    pub fn payload(&self) -> &RecordPayload {
        &self.payload
    }

    /// Unit id, if this record belongs to an atomic operation unit.
    pub fn operation_unit_id(&self) -> Option<OperationUnitId> {
        self.payload.operation_unit_id()
    }

    /// LSN assigned at append time. Strictly increasing across the log.
    pub fn lsn(&self) -> Lsn {
        self.lsn
            .expect("LSN requested before the record was appended")
    }

    /// Whether an LSN has been assigned yet.
    pub fn is_positioned(&self) -> bool {
        self.lsn.is_some()
    }

    /// Byte distance from the previous record's start to this one's.
    pub fn distance_to_prev(&self) -> u64 {
        self.distance_to_prev
            .expect("positioning metadata requested before the record was placed")
    }

    /// Total bytes this record occupies on disk, framing included.
    pub fn disk_size(&self) -> u32 {
        self.disk_size
            .expect("positioning metadata requested before the record was placed")
    }

    /// Whether the record has reached the log file.
    pub fn is_written(&self) -> bool {
        self.written
    }

    pub(crate) fn assign_position(&mut self, lsn: Lsn, distance_to_prev: u64, disk_size: u32) {
        assert!(
            self.lsn.is_none(),
            "record positioned twice (lsn {} already assigned)",
            self.lsn.unwrap_or(Lsn::ZERO)
        );
        self.lsn = Some(lsn);
        self.distance_to_prev = Some(distance_to_prev);
        self.disk_size = Some(disk_size);
    }

    pub(crate) fn mark_written(&mut self) {
        self.written = true;
    }
}
