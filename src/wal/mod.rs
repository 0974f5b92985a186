//! Write-ahead logging: the record model, atomic operation units and the
//! append-only log file they are written to.

#![forbid(unsafe_code)]

mod log;
mod record;

pub use log::{
    replay, Replay, ReplayUnit, UnitOutcome, WalLog, WalLogIterator, WalLogOptions,
};
pub use record::{RecordPayload, RecordType, WalRecord};
