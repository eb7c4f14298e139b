//! Redo recovery.
//!
//! Replays the redo log into the paged object store after an unclean
//! shutdown. The scan starts at the last complete database checkpoint
//! (its START record lists every transaction that was still active,
//! with the position each one must be replayed from); everything
//! before that point was durably flushed when the checkpoint's END
//! record was written.
//!
//! Only committed transactions are replayed. OID allocation uses the
//! idempotent path, since the original allocation side effect may or
//! may not have made it to the volume before the crash.

use orion_core::{LogPosition, RedoLog, RedoRecord, Result, TxnId};
use orion_storage::ObjectStore;
use rustc_hash::FxHashSet;
use tracing::{debug, info};

/// What recovery did, for logging and assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records examined during the replay pass.
    pub records_scanned: usize,
    /// Committed transactions whose stores were re-applied.
    pub replayed_txns: usize,
    /// Transactions discarded (rolled back or never committed).
    pub discarded_txns: usize,
    /// Store records applied to the object store.
    pub objects_applied: usize,
    /// Position the replay pass started from.
    pub scan_start: LogPosition,
}

/// Replay committed transactions from `log` into `store`.
///
/// The store's pages are synced before returning, so a crash during
/// recovery just recovers again from the same log.
pub fn recover(store: &ObjectStore, log: &dyn RedoLog) -> Result<RecoveryReport> {
    let all = log.scan(LogPosition::START)?;

    // Find the last complete database checkpoint: the latest
    // START/END pair. Transactions listed in its START record resume
    // from their recorded positions; if none were active, nothing
    // before the START record matters.
    let mut pending_start: Option<(LogPosition, &[(TxnId, LogPosition)])> = None;
    let mut checkpoint: Option<(LogPosition, &[(TxnId, LogPosition)])> = None;
    for (position, record) in &all {
        match record {
            RedoRecord::StartDbCheckpoint { active } => {
                pending_start = Some((*position, active.as_slice()));
            }
            RedoRecord::EndDbCheckpoint => {
                if let Some(start) = pending_start.take() {
                    checkpoint = Some(start);
                }
            }
            _ => {}
        }
    }
    let scan_start = match checkpoint {
        Some((start_position, active)) => active
            .iter()
            .map(|(_, position)| *position)
            .min()
            .unwrap_or(start_position),
        None => LogPosition::START,
    };

    // Winners: transactions with a COMMIT record in the replayed
    // range. Everything else in the range is discarded.
    let mut winners: FxHashSet<TxnId> = FxHashSet::default();
    let mut seen: FxHashSet<TxnId> = FxHashSet::default();
    let tail: Vec<_> = all
        .iter()
        .filter(|(position, _)| *position >= scan_start)
        .collect();
    for (_, record) in &tail {
        if let Some(txn) = record.txn() {
            seen.insert(txn);
            if matches!(record, RedoRecord::Commit { .. }) {
                winners.insert(txn);
            }
        }
    }

    let mut report = RecoveryReport {
        records_scanned: tail.len(),
        replayed_txns: winners.len(),
        discarded_txns: seen.len() - winners.len(),
        objects_applied: 0,
        scan_start,
    };

    for (_, record) in &tail {
        if let RedoRecord::Store {
            txn,
            oid,
            cid,
            image,
        } = record
        {
            if winners.contains(txn) {
                store.ensure_oid_allocated(*oid)?;
                store.store(*cid, *oid, image)?;
                report.objects_applied += 1;
                debug!(target: "orion::recovery", %txn, %oid, len = image.len(), "replayed");
            }
        }
    }

    store.sync()?;
    info!(
        target: "orion::recovery",
        replayed = report.replayed_txns,
        discarded = report.discarded_txns,
        objects = report.objects_applied,
        "recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryRedoLog;
    use orion_core::{BlockVolume, Cid, Oid};
    use orion_storage::MemoryVolume;
    use std::sync::Arc;

    fn fresh_store() -> ObjectStore {
        let volume: Arc<dyn BlockVolume> = Arc::new(MemoryVolume::new(256, None));
        ObjectStore::format(volume).unwrap()
    }

    fn begin(log: &MemoryRedoLog) -> TxnId {
        log.append(&RedoRecord::Begin {
            txn: TxnId::UNASSIGNED,
        })
        .unwrap()
        .assigned_txn
        .unwrap()
    }

    fn log_store(log: &MemoryRedoLog, txn: TxnId, oid: Oid, image: &[u8]) {
        log.append(&RedoRecord::Store {
            txn,
            oid,
            cid: Cid::new(64),
            image: image.to_vec(),
        })
        .unwrap();
    }

    #[test]
    fn committed_transaction_is_replayed() {
        let store = fresh_store();
        let log = MemoryRedoLog::new();
        let oid = Oid::new(100);

        let txn = begin(&log);
        log_store(&log, txn, oid, b"durable image");
        log.append(&RedoRecord::Commit { txn }).unwrap();

        // Crash before the page write: the store never saw the object
        let report = recover(&store, &log).unwrap();
        assert_eq!(report.replayed_txns, 1);
        assert_eq!(report.objects_applied, 1);
        assert_eq!(store.load(oid).unwrap(), b"durable image");
    }

    #[test]
    fn uncommitted_and_rolled_back_transactions_are_discarded() {
        let store = fresh_store();
        let log = MemoryRedoLog::new();

        let unfinished = begin(&log);
        log_store(&log, unfinished, Oid::new(100), b"in flight");

        let rolled_back = begin(&log);
        log_store(&log, rolled_back, Oid::new(101), b"abandoned");
        log.append(&RedoRecord::Rollback { txn: rolled_back }).unwrap();

        let report = recover(&store, &log).unwrap();
        assert_eq!(report.replayed_txns, 0);
        assert_eq!(report.discarded_txns, 2);
        assert!(store.load(Oid::new(100)).is_err());
        assert!(store.load(Oid::new(101)).is_err());
    }

    #[test]
    fn replay_starts_at_last_complete_checkpoint() {
        let store = fresh_store();
        let log = MemoryRedoLog::new();

        // A fully flushed transaction before the checkpoint; its data
        // is already in the store.
        let old = begin(&log);
        log_store(&log, old, Oid::new(100), b"already flushed");
        log.append(&RedoRecord::Commit { txn: old }).unwrap();
        store.ensure_oid_allocated(Oid::new(100)).unwrap();
        store
            .store(Cid::new(64), Oid::new(100), b"already flushed")
            .unwrap();

        log.append(&RedoRecord::StartDbCheckpoint { active: Vec::new() })
            .unwrap();
        log.append(&RedoRecord::EndDbCheckpoint).unwrap();

        // A transaction after the checkpoint, committed but unapplied
        let fresh = begin(&log);
        log_store(&log, fresh, Oid::new(101), b"needs replay");
        log.append(&RedoRecord::Commit { txn: fresh }).unwrap();

        let report = recover(&store, &log).unwrap();
        assert_eq!(report.replayed_txns, 1, "pre-checkpoint txn not replayed");
        assert_eq!(store.load(Oid::new(101)).unwrap(), b"needs replay");
        assert_eq!(store.load(Oid::new(100)).unwrap(), b"already flushed");
    }

    #[test]
    fn checkpoint_active_list_extends_the_scan_backwards() {
        let store = fresh_store();
        let log = MemoryRedoLog::new();

        // Transaction begins before the checkpoint, commits after it
        let spanning = begin(&log);
        let begin_pos = LogPosition::from_raw(0);
        log_store(&log, spanning, Oid::new(100), b"spans the checkpoint");

        log.append(&RedoRecord::StartDbCheckpoint {
            active: vec![(spanning, begin_pos)],
        })
        .unwrap();
        log.append(&RedoRecord::EndDbCheckpoint).unwrap();
        log.append(&RedoRecord::Commit { txn: spanning }).unwrap();

        let report = recover(&store, &log).unwrap();
        assert_eq!(report.scan_start, begin_pos);
        assert_eq!(store.load(Oid::new(100)).unwrap(), b"spans the checkpoint");
    }

    #[test]
    fn replay_is_idempotent() {
        let store = fresh_store();
        let log = MemoryRedoLog::new();
        let oid = Oid::new(100);

        let txn = begin(&log);
        log_store(&log, txn, oid, b"one");
        log_store(&log, txn, oid, b"two");
        log.append(&RedoRecord::Commit { txn }).unwrap();

        recover(&store, &log).unwrap();
        recover(&store, &log).unwrap();
        assert_eq!(store.load(oid).unwrap(), b"two");
    }
}
