//! Append-only log file: LSN assignment, length-framed record placement
//! and the replay iterator recovery reads the log with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::checksum::{buffer_crc32, record_crc32};
use crate::types::{Lsn, OperationUnitId, Result, UmbraError};
use crate::wal::record::{RecordPayload, WalRecord};

const WAL_MAGIC: [u8; 4] = *b"UWAL";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 28;
/// LSN (8) + payload length (4) + payload CRC32 (4).
const FRAME_HEADER_LEN: usize = 16;

/// Configuration for opening a [`WalLog`].
#[derive(Clone, Debug)]
pub struct WalLogOptions {
    /// Random value distinguishing this log from a stale file of another
    /// storage instance.
    pub salt: u64,
    /// LSN immediately before the first record this log will hold.
    pub start_lsn: Lsn,
}

impl WalLogOptions {
    /// Options with a fresh random salt.
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            salt: rand::random(),
            start_lsn,
        }
    }
}

impl Default for WalLogOptions {
    fn default() -> Self {
        Self::new(Lsn::ZERO)
    }
}

struct LogHeader {
    salt: u64,
    start_lsn: Lsn,
}

impl LogHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        buf[16..24].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = buffer_crc32(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(UmbraError::Corruption("wal header truncated"));
        }
        if src[0..4] != WAL_MAGIC {
            return Err(UmbraError::Corruption("wal magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().unwrap());
        if version != WAL_FORMAT_VERSION {
            return Err(UmbraError::Corruption("wal format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(src[24..28].try_into().unwrap());
        if buffer_crc32(&src[..24]) != stored_crc {
            return Err(UmbraError::Corruption("wal header crc mismatch"));
        }
        let salt = u64::from_be_bytes(src[8..16].try_into().unwrap());
        let start_lsn = Lsn(u64::from_be_bytes(src[16..24].try_into().unwrap()));
        Ok(Self { salt, start_lsn })
    }
}

struct LogState {
    header: LogHeader,
    last_lsn: Lsn,
    append_offset: u64,
    prev_record_offset: Option<u64>,
}

/// Append-only write-ahead log file.
///
/// Appends assign strictly increasing LSNs and compute each record's
/// placement metadata (distance to the previous record, on-disk size).
/// Producer threads feed appends through an external serializing path;
/// internally the append state lives under one mutex, making the log
/// logically single-writer.
pub struct WalLog {
    io: Arc<dyn FileIo>,
    state: Mutex<LogState>,
}

impl WalLog {
    /// Opens or creates a log. An existing file is validated and scanned
    /// to the last intact record so appends resume after a crash.
    pub fn open(io: Arc<dyn FileIo>, options: WalLogOptions) -> Result<Self> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            let header = LogHeader {
                salt: options.salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            let state = LogState {
                last_lsn: header.start_lsn,
                append_offset: FILE_HEADER_LEN as u64,
                prev_record_offset: None,
                header,
            };
            return Ok(Self {
                io,
                state: Mutex::new(state),
            });
        }

        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = LogHeader::decode(&buf)?;
        let mut iter = WalLogIterator::new(Arc::clone(&io), header.start_lsn, len);
        let mut last_lsn = header.start_lsn;
        let mut prev_record_offset = None;
        loop {
            let record_offset = iter.offset;
            match iter.next_record()? {
                Some(record) => {
                    last_lsn = record.lsn();
                    prev_record_offset = Some(record_offset);
                }
                None => break,
            }
        }
        let append_offset = iter.valid_up_to();
        debug!(
            last_lsn = last_lsn.0,
            append_offset, "wal.log.open.scanned"
        );
        Ok(Self {
            io,
            state: Mutex::new(LogState {
                header,
                last_lsn,
                append_offset,
                prev_record_offset,
            }),
        })
    }

    /// Appends `record`, assigning its LSN and placement metadata and
    /// marking it written. The record must not have been appended before.
    pub fn append(&self, record: &mut WalRecord) -> Result<Lsn> {
        assert!(
            !record.is_positioned(),
            "record appended to the log twice"
        );
        let mut state = self.state.lock();
        let lsn = state.last_lsn.next();

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + record.payload().encoded_size());
        frame.extend_from_slice(&lsn.0.to_be_bytes());
        let payload_start = FRAME_HEADER_LEN;
        frame.resize(payload_start, 0);
        record.payload().encode(&mut frame);
        let payload_len = (frame.len() - payload_start) as u32;
        let crc = record_crc32(lsn, &frame[payload_start..]);
        frame[8..12].copy_from_slice(&payload_len.to_be_bytes());
        frame[12..16].copy_from_slice(&crc.to_be_bytes());

        let record_offset = state.append_offset;
        self.io.write_at(record_offset, &frame)?;

        let distance = state
            .prev_record_offset
            .map_or(0, |prev| record_offset - prev);
        record.assign_position(lsn, distance, frame.len() as u32);
        record.mark_written();

        state.last_lsn = lsn;
        state.prev_record_offset = Some(record_offset);
        state.append_offset = record_offset + frame.len() as u64;
        Ok(lsn)
    }

    /// Flushes appended records to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        debug!("wal.log.synced");
        Ok(())
    }

    /// LSN of the most recently appended record.
    pub fn end_lsn(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    /// Salt written into this log's header.
    pub fn salt(&self) -> u64 {
        self.state.lock().header.salt
    }

    /// Iterator over intact records in LSN order.
    pub fn iter(&self) -> Result<WalLogIterator> {
        let end = self.io.len()?;
        let start_lsn = self.state.lock().header.start_lsn;
        Ok(WalLogIterator::new(Arc::clone(&self.io), start_lsn, end))
    }
}

/// Reads records back in append order, stopping cleanly at the first torn
/// or corrupt frame.
pub struct WalLogIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    last_lsn: Lsn,
    prev_record_offset: Option<u64>,
    valid_up_to: u64,
}

impl WalLogIterator {
    fn new(io: Arc<dyn FileIo>, start_lsn: Lsn, end: u64) -> Self {
        Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            last_lsn: start_lsn,
            prev_record_offset: None,
            valid_up_to: FILE_HEADER_LEN as u64,
        }
    }

    /// Next intact record, or `None` at the end of the valid prefix.
    ///
    /// A frame that decodes but regresses the LSN sequence is a hard
    /// corruption error rather than a clean end: the log's total order is
    /// load-bearing for recovery.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(self.offset, &mut header)?;
        let lsn = Lsn(u64::from_be_bytes(header[0..8].try_into().unwrap()));
        let payload_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let stored_crc = u32::from_be_bytes(header[12..16].try_into().unwrap());

        let payload_offset = self.offset + FRAME_HEADER_LEN as u64;
        if payload_offset + payload_len as u64 > self.end {
            // Torn tail from an interrupted append.
            self.offset = self.end;
            return Ok(None);
        }
        let mut payload = vec![0u8; payload_len];
        self.io.read_at(payload_offset, &mut payload)?;
        if record_crc32(lsn, &payload) != stored_crc {
            self.offset = self.end;
            return Ok(None);
        }
        if lsn <= self.last_lsn {
            return Err(UmbraError::Corruption("wal lsn sequence regressed"));
        }

        let decoded = RecordPayload::decode(&payload)?;
        let disk_size = (FRAME_HEADER_LEN + payload_len) as u32;
        let distance = self
            .prev_record_offset
            .map_or(0, |prev| self.offset - prev);
        let mut record = WalRecord::new(decoded);
        record.assign_position(lsn, distance, disk_size);
        record.mark_written();

        self.last_lsn = lsn;
        self.prev_record_offset = Some(self.offset);
        self.offset += u64::from(disk_size);
        self.valid_up_to = self.offset;
        Ok(Some(record))
    }

    /// File offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

/// How an atomic unit ended, as recovery sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Start and commit end both present: replay the unit.
    Committed,
    /// Closed by a rollback end: already undone, skip.
    RolledBack,
    /// No end record reached the log: must be undone.
    Unfinished,
}

/// One atomic unit's records, grouped for replay.
#[derive(Debug)]
pub struct ReplayUnit {
    /// The unit's identifier.
    pub unit_id: OperationUnitId,
    /// Whether the start record advertised undo information.
    pub has_undo: bool,
    /// Completed, rolled back or unfinished.
    pub outcome: UnitOutcome,
    /// Every record of the unit, in append (LSN) order.
    pub records: Vec<WalRecord>,
}

/// Log contents regrouped by operation unit.
#[derive(Debug, Default)]
pub struct Replay {
    /// Units ordered by the LSN of their first record.
    pub units: Vec<ReplayUnit>,
    /// Markers outside atomic-unit framing; always applied.
    pub non_tx: Vec<WalRecord>,
}

/// Reads the whole valid prefix of `log` and groups records by operation
/// unit, classifying each unit's outcome from its start/end pairing.
pub fn replay(log: &WalLog) -> Result<Replay> {
    let mut iter = log.iter()?;
    let mut replay = Replay::default();
    let mut unit_slots: HashMap<OperationUnitId, usize> = HashMap::new();
    while let Some(record) = iter.next_record()? {
        let Some(unit_id) = record.operation_unit_id() else {
            replay.non_tx.push(record);
            continue;
        };
        let slot = *unit_slots.entry(unit_id).or_insert_with(|| {
            replay.units.push(ReplayUnit {
                unit_id,
                has_undo: false,
                outcome: UnitOutcome::Unfinished,
                records: Vec::new(),
            });
            replay.units.len() - 1
        });
        let unit = &mut replay.units[slot];
        match record.payload() {
            RecordPayload::AtomicUnitStart { has_undo, .. } => {
                unit.has_undo = *has_undo;
            }
            RecordPayload::AtomicUnitEnd { rollback, .. } => {
                unit.outcome = if *rollback {
                    UnitOutcome::RolledBack
                } else {
                    UnitOutcome::Committed
                };
            }
            _ => {}
        }
        unit.records.push(record);
    }
    Ok(replay)
}
