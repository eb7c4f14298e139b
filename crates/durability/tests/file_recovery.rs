//! Crash-shaped recovery tests over the file-backed log and volume.

use orion_core::{BlockVolume, Cid, Oid, RedoLog, RedoRecord, TxnId};
use orion_durability::{recover, FileRedoLog};
use orion_storage::{FileVolume, ObjectStore};
use std::sync::Arc;
use tempfile::TempDir;

const PAGE: usize = 256;

#[test]
fn committed_work_survives_crash_and_reopen() {
    let dir = TempDir::new().unwrap();
    let volume_path = dir.path().join("data.orn");
    let log_dir = dir.path().join("redo");
    let oid = Oid::new(100);
    let image: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();

    {
        let volume = Arc::new(FileVolume::create(&volume_path, PAGE, None).unwrap());
        let _store = ObjectStore::format(Arc::clone(&volume) as Arc<dyn BlockVolume>).unwrap();
        volume.sync_all_pages().unwrap();

        let log = FileRedoLog::open(&log_dir, 1 << 20).unwrap();
        let txn = log
            .append(&RedoRecord::Begin {
                txn: TxnId::UNASSIGNED,
            })
            .unwrap()
            .assigned_txn
            .unwrap();
        log.append(&RedoRecord::Store {
            txn,
            oid,
            cid: Cid::new(64),
            image: image.clone(),
        })
        .unwrap();
        log.append(&RedoRecord::Commit { txn }).unwrap();
        // Crash here: commit is durable in the log, the page write
        // never happened, and the volume is not closed cleanly.
    }

    let volume = Arc::new(FileVolume::open_unchecked(&volume_path, None).unwrap());
    assert!(!volume.was_clean());
    let store = ObjectStore::open(Arc::clone(&volume) as Arc<dyn BlockVolume>).unwrap();
    let log = FileRedoLog::open(&log_dir, 1 << 20).unwrap();

    let report = recover(&store, &log).unwrap();
    assert_eq!(report.replayed_txns, 1);
    assert_eq!(store.load(oid).unwrap(), image);
    volume.close().unwrap();
}

#[test]
fn recovery_is_stable_across_repeated_crashes() {
    let dir = TempDir::new().unwrap();
    let volume_path = dir.path().join("data.orn");
    let log_dir = dir.path().join("redo");
    let oid = Oid::new(100);

    {
        let volume = Arc::new(FileVolume::create(&volume_path, PAGE, None).unwrap());
        let _store = ObjectStore::format(Arc::clone(&volume) as Arc<dyn BlockVolume>).unwrap();
        volume.sync_all_pages().unwrap();
        let log = FileRedoLog::open(&log_dir, 1 << 20).unwrap();
        let txn = log
            .append(&RedoRecord::Begin {
                txn: TxnId::UNASSIGNED,
            })
            .unwrap()
            .assigned_txn
            .unwrap();
        log.append(&RedoRecord::Store {
            txn,
            oid,
            cid: Cid::new(64),
            image: b"crash me twice".to_vec(),
        })
        .unwrap();
        log.append(&RedoRecord::Commit { txn }).unwrap();
    }

    // Recover, "crash" again before closing, recover again.
    for _ in 0..2 {
        let volume = Arc::new(FileVolume::open_unchecked(&volume_path, None).unwrap());
        let store = ObjectStore::open(Arc::clone(&volume) as Arc<dyn BlockVolume>).unwrap();
        let log = FileRedoLog::open(&log_dir, 1 << 20).unwrap();
        recover(&store, &log).unwrap();
        assert_eq!(store.load(oid).unwrap(), b"crash me twice");
        // No clean close: the next iteration recovers from scratch
    }
}
