//! Collaborator seams between the crates.
//!
//! The engine consumes two external collaborators through traits:
//! the block volume (fixed-size page device) and the redo log
//! (append-only durable record stream). Both have in-memory and
//! file-backed implementations elsewhere in the workspace; the core
//! never depends on either.

use crate::error::Result;
use crate::types::{Cid, LogPosition, Oid, TxnId};

/// Fixed-size page device.
///
/// All page offsets are logical; the implementation is responsible
/// for logical-to-physical translation and for maintaining its own
/// free-page list. Implementations never hand out page 0 (reserved
/// for their own header), which is what makes byte address 0 a safe
/// null sentinel for object pointers.
pub trait BlockVolume: Send + Sync {
    /// Read `buf.len()` bytes from `page` starting at `offset` within
    /// the page.
    fn load_page(&self, buf: &mut [u8], page: u64, offset: usize) -> Result<()>;

    /// Write `buf` to `page` starting at `offset` within the page.
    fn store_page(&self, buf: &[u8], page: u64, offset: usize) -> Result<()>;

    /// Allocate a page and return its logical offset. The page's
    /// previous contents are unspecified; callers initialize it.
    fn allocate_page(&self) -> Result<u64>;

    /// Return a page to the free-page pool.
    fn free_page(&self, page: u64) -> Result<()>;

    /// Flush all outstanding page writes to stable storage.
    fn sync_all_pages(&self) -> Result<()>;

    /// Page size in bytes. Constant for the life of the volume.
    fn page_size(&self) -> usize;

    /// Whether the volume rejects writes.
    fn is_read_only(&self) -> bool;
}

/// One typed record in the redo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    /// Transaction start. Appending this assigns the transaction id:
    /// pass [`TxnId::UNASSIGNED`] and read the id back from
    /// [`AppendOutcome::assigned_txn`].
    Begin {
        /// Assigned id (placeholder on append).
        txn: TxnId,
    },
    /// One pending object write.
    Store {
        /// Owning transaction.
        txn: TxnId,
        /// Object being written.
        oid: Oid,
        /// Class of the object.
        cid: Cid,
        /// Serialized object image.
        image: Vec<u8>,
    },
    /// Transaction checkpoint: pending updates were flushed without
    /// ending the transaction.
    Checkpoint {
        /// Owning transaction.
        txn: TxnId,
    },
    /// Transaction commit. Durably flushed by the log.
    Commit {
        /// Owning transaction.
        txn: TxnId,
    },
    /// Transaction rollback.
    Rollback {
        /// Owning transaction.
        txn: TxnId,
    },
    /// Start of a database checkpoint, listing every still-active
    /// transaction and the position of its BEGIN (or latest
    /// CHECKPOINT) record. Recovery needs this list to know which
    /// transactions to replay.
    StartDbCheckpoint {
        /// (transaction, replay start position) pairs.
        active: Vec<(TxnId, LogPosition)>,
    },
    /// End of a database checkpoint: all prior page writes are durable.
    /// Durably flushed by the log.
    EndDbCheckpoint,
}

impl RedoRecord {
    /// Transaction this record belongs to, if any.
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            RedoRecord::Begin { txn }
            | RedoRecord::Store { txn, .. }
            | RedoRecord::Checkpoint { txn }
            | RedoRecord::Commit { txn }
            | RedoRecord::Rollback { txn } => Some(*txn),
            RedoRecord::StartDbCheckpoint { .. } | RedoRecord::EndDbCheckpoint => None,
        }
    }

    /// Whether appending this record must flush the log durably before
    /// returning.
    pub fn requires_flush(&self) -> bool {
        matches!(
            self,
            RedoRecord::Commit { .. }
                | RedoRecord::Checkpoint { .. }
                | RedoRecord::EndDbCheckpoint
        )
    }
}

/// Result of appending a record to the redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Position the record was written at; `read` returns it.
    pub position: LogPosition,
    /// Transaction id assigned by the log, present only for BEGIN
    /// records.
    pub assigned_txn: Option<TxnId>,
}

/// Append-only durable record log, read back by position.
pub trait RedoLog: Send + Sync {
    /// Append a record and return its position. For BEGIN records the
    /// log assigns and returns the transaction id. Records whose kind
    /// `requires_flush` are durable when this returns.
    fn append(&self, record: &RedoRecord) -> Result<AppendOutcome>;

    /// Read the record written at `position`.
    fn read(&self, position: LogPosition) -> Result<RedoRecord>;

    /// Visit every record at or after `from`, in log order. A torn
    /// final record (crash mid-append) ends the scan without error.
    fn scan(&self, from: LogPosition) -> Result<Vec<(LogPosition, RedoRecord)>>;

    /// Force everything appended so far to stable storage.
    fn sync(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_txn_extraction() {
        assert_eq!(
            RedoRecord::Commit { txn: TxnId::new(4) }.txn(),
            Some(TxnId::new(4))
        );
        assert_eq!(RedoRecord::EndDbCheckpoint.txn(), None);
    }

    #[test]
    fn flush_required_kinds() {
        assert!(RedoRecord::Commit { txn: TxnId::new(1) }.requires_flush());
        assert!(RedoRecord::Checkpoint { txn: TxnId::new(1) }.requires_flush());
        assert!(RedoRecord::EndDbCheckpoint.requires_flush());
        assert!(!RedoRecord::Begin {
            txn: TxnId::UNASSIGNED
        }
        .requires_flush());
        assert!(!RedoRecord::Rollback { txn: TxnId::new(1) }.requires_flush());
    }
}
