//! Storage transaction state.
//!
//! A `StorageTransaction` pairs a lock-scheduler transaction with its
//! redo-log transaction id and tracks the pending writes that have
//! been logged but not yet flushed to the object store.
//!
//! State transitions:
//! - `Active` → `Active` (any number of checkpoints)
//! - `Active` → `Committed` | `Aborted` (terminal; locks released,
//!   update-cache entries cleared)

use orion_concurrency::TxnHandle;
use orion_core::{Error, LogPosition, Oid, Result, TxnId};

/// Lifecycle state of a storage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Executing; reads and writes are accepted.
    Active,
    /// Committed; terminal.
    Committed,
    /// Rolled back (by the caller or by shutdown); terminal.
    Aborted,
}

/// One session's transaction against the database.
///
/// Created by `Coordinator::begin`; consumed by `commit` or
/// `rollback`. Dropping an active transaction without either is the
/// caller's bug; shutdown force-rolls such transactions back.
#[derive(Debug)]
pub struct StorageTransaction {
    pub(crate) txn_id: TxnId,
    pub(crate) lock: TxnHandle,
    /// Position of the BEGIN record, or of the latest CHECKPOINT
    /// record once one has been written. Recovery replays the
    /// transaction from here.
    pub(crate) start_position: LogPosition,
    /// OIDs written since the last checkpoint, in first-write order.
    pub(crate) pending: Vec<Oid>,
    pub(crate) state: TxnState,
}

impl StorageTransaction {
    pub(crate) fn new(txn_id: TxnId, lock: TxnHandle, start_position: LogPosition) -> Self {
        StorageTransaction {
            txn_id,
            lock,
            start_position,
            pending: Vec::new(),
            state: TxnState::Active,
        }
    }

    /// Redo-log transaction id.
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Log position recovery would replay this transaction from.
    pub fn start_position(&self) -> LogPosition {
        self.start_position
    }

    /// Number of writes pending since the last checkpoint.
    pub fn pending_updates(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(Error::TransactionNotInProgress)
        }
    }
}
