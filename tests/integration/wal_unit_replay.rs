//! End-to-end WAL scenarios: heavily interleaved units replayed after a
//! reopen, and recovery from a torn tail.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use umbra::primitives::io::{FileIo, StdFileIo};
use umbra::types::{FileId, Lsn, OperationUnitId, PageIndex};
use umbra::wal::{replay, RecordPayload, UnitOutcome, WalLog, WalLogOptions, WalRecord};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_log(io: Arc<StdFileIo>) -> WalLog {
    WalLog::open(io as Arc<dyn FileIo>, WalLogOptions::default()).unwrap()
}

fn update(unit: u64, page: u64, data: Vec<u8>) -> RecordPayload {
    RecordPayload::PageUpdate {
        unit_id: OperationUnitId(unit),
        file_id: FileId(1),
        page_index: PageIndex(page),
        offset: 0,
        data,
    }
}

#[test]
fn interleaved_units_replay_grouped_in_append_order() {
    init_tracing();
    let dir = tempdir().unwrap();
    let io = Arc::new(StdFileIo::open(dir.path().join("wal")).unwrap());
    let log = open_log(Arc::clone(&io));
    let mut rng = ChaCha8Rng::seed_from_u64(0xDB_CAFE);

    // Ten units of 100 records each (unit 9 loses its end record), plus a
    // non-transactional marker: 1000 appends total.
    const UNITS: u64 = 10;
    const UPDATES_PER_UNIT: usize = 98;

    let mut queues: Vec<Vec<RecordPayload>> = (0..UNITS)
        .map(|unit| {
            let mut queue = vec![RecordPayload::AtomicUnitStart {
                unit_id: OperationUnitId(unit),
                has_undo: unit % 2 == 0,
            }];
            for step in 0..UPDATES_PER_UNIT {
                let data = (0..rng.gen_range(1..32)).map(|_| rng.gen()).collect();
                queue.push(update(unit, step as u64, data));
            }
            if unit != 9 {
                queue.push(RecordPayload::AtomicUnitEnd {
                    unit_id: OperationUnitId(unit),
                    rollback: unit % 3 == 0,
                });
            }
            queue.reverse(); // pop() takes from the front of the unit
            queue
        })
        .collect();
    queues.push(vec![RecordPayload::NonTxOperationPerformed]);

    let mut appended: HashMap<Option<OperationUnitId>, Vec<Lsn>> = HashMap::new();
    let mut total = 0usize;
    let mut last_lsn = Lsn::ZERO;
    loop {
        let nonempty: Vec<usize> = (0..queues.len())
            .filter(|&queue| !queues[queue].is_empty())
            .collect();
        let Some(&pick) = nonempty.choose(&mut rng) else {
            break;
        };
        let payload = queues[pick].pop().unwrap();
        let mut record = WalRecord::new(payload);
        let lsn = log.append(&mut record).unwrap();
        assert!(lsn > last_lsn, "LSNs must be strictly increasing");
        last_lsn = lsn;
        appended
            .entry(record.operation_unit_id())
            .or_default()
            .push(lsn);
        total += 1;
    }
    assert_eq!(total, 1000);
    log.sync().unwrap();
    drop(log);

    // Reopen as recovery would and regroup by unit.
    let log = open_log(io);
    assert_eq!(log.end_lsn(), Lsn(1000));
    let replay = replay(&log).unwrap();

    assert_eq!(replay.units.len(), UNITS as usize);
    assert_eq!(replay.non_tx.len(), 1);

    for unit in &replay.units {
        let expected = &appended[&Some(unit.unit_id)];
        let got: Vec<Lsn> = unit.records.iter().map(|record| record.lsn()).collect();
        assert_eq!(&got, expected, "unit {} records out of order", unit.unit_id);

        let id = unit.unit_id.0;
        assert_eq!(unit.has_undo, id % 2 == 0);
        let expected_outcome = if id == 9 {
            UnitOutcome::Unfinished
        } else if id % 3 == 0 {
            UnitOutcome::RolledBack
        } else {
            UnitOutcome::Committed
        };
        assert_eq!(unit.outcome, expected_outcome, "unit {id}");
    }

    // Units are ordered by their first record's LSN.
    let first_lsns: Vec<Lsn> = replay
        .units
        .iter()
        .map(|unit| unit.records[0].lsn())
        .collect();
    let mut sorted = first_lsns.clone();
    sorted.sort_unstable();
    assert_eq!(first_lsns, sorted);
}

#[test]
fn torn_tail_leaves_the_interrupted_unit_unfinished() {
    init_tracing();
    let dir = tempdir().unwrap();
    let io = Arc::new(StdFileIo::open(dir.path().join("wal")).unwrap());
    let log = open_log(Arc::clone(&io));

    log.append(&mut WalRecord::new(RecordPayload::AtomicUnitStart {
        unit_id: OperationUnitId(1),
        has_undo: true,
    }))
    .unwrap();
    log.append(&mut WalRecord::new(update(1, 0, b"applied".to_vec())))
        .unwrap();
    let mut end = WalRecord::new(RecordPayload::AtomicUnitEnd {
        unit_id: OperationUnitId(1),
        rollback: false,
    });
    log.append(&mut end).unwrap();
    log.sync().unwrap();
    drop(log);

    // The crash cut the commit record in half.
    let len = io.len().unwrap();
    io.truncate(len - u64::from(end.disk_size()) + 3).unwrap();

    let log = open_log(Arc::clone(&io));
    let replay = replay(&log).unwrap();
    assert_eq!(replay.units.len(), 1);
    let unit = &replay.units[0];
    assert_eq!(unit.outcome, UnitOutcome::Unfinished);
    assert!(unit.has_undo);
    assert_eq!(unit.records.len(), 2);

    // New appends continue the sequence from the last intact record.
    assert_eq!(log.end_lsn(), Lsn(2));
    let mut retry = WalRecord::new(RecordPayload::AtomicUnitEnd {
        unit_id: OperationUnitId(1),
        rollback: true,
    });
    assert_eq!(log.append(&mut retry).unwrap(), Lsn(3));
}
