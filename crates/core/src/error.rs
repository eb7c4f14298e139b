//! Error types for OrionDB
//!
//! One error enum serves the whole engine. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! Propagation policy: corruption and capacity errors are never
//! swallowed or auto-repaired anywhere in the engine; they carry
//! enough context (OID, page, position) to diagnose the failure.

use crate::types::{LockKey, LogPosition, Oid};
use std::io;
use thiserror::Error;

/// Result type alias for OrionDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the OrionDB engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the volume or log file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-page or on-log data failed a consistency check. Indicates
    /// media or logic failure; the operation is abandoned, nothing is
    /// repaired.
    #[error("corrupt database: {context}")]
    Corrupt {
        /// What was inconsistent and where
        context: String,
    },

    /// The volume has no free pages and its bounded maximum size was
    /// reached.
    #[error("volume has no more space")]
    NoMoreSpace,

    /// No database exists at the given location.
    #[error("database not found: {0}")]
    NotFound(String),

    /// Operation on a database that is not connected (already closed).
    #[error("database not connected")]
    NotConnected,

    /// Another handle in this process already has the database open.
    #[error("database already open: {0}")]
    AlreadyOpen(String),

    /// The volume was not closed cleanly; recovery must run before
    /// normal use.
    #[error("volume needs recovery")]
    NeedsRecovery,

    /// A lock request was not granted within its wait time (or the
    /// caller asked for a non-blocking probe). Distinct from
    /// [`Error::Deadlock`]; the scheduler never retries on its own.
    #[error("lock not granted on {key}")]
    LockNotGranted {
        /// Key the request was for
        key: LockKey,
    },

    /// Granting the lock would complete (or, with the timestamp
    /// detector, might complete) a wait-for cycle. The requesting
    /// transaction must be aborted by its caller.
    #[error("deadlock detected while locking {key}")]
    Deadlock {
        /// Key the request was for
        key: LockKey,
    },

    /// A transactional operation was called with no active transaction
    /// on the session, or on a transaction already committed/aborted.
    #[error("no transaction in progress")]
    TransactionNotInProgress,

    /// The requested object does not exist (null entry in the OID
    /// table).
    #[error("object not found: {0}")]
    ObjectNotFound(Oid),

    /// An object image is larger than the on-page format's signed
    /// 32-bit total-length field can express.
    #[error("object image of {len} bytes exceeds the format limit")]
    ImageTooLarge {
        /// Size of the rejected image
        len: usize,
    },

    /// The redo log has no record at the given position.
    #[error("no redo record at {0}")]
    LogPositionNotFound(LogPosition),

    /// New transactions are refused because the database is shutting
    /// down.
    #[error("database is shutting down")]
    ShuttingDown,

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Shorthand for a corruption error with formatted context.
    pub fn corrupt(context: impl Into<String>) -> Self {
        Error::Corrupt {
            context: context.into(),
        }
    }

    /// Whether this error is the deadlock variant.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn display_corrupt() {
        let err = Error::corrupt("oid mismatch at ptr:0x40");
        let msg = err.to_string();
        assert!(msg.contains("corrupt database"));
        assert!(msg.contains("oid mismatch"));
    }

    #[test]
    fn display_lock_errors_are_distinct() {
        let not_granted = Error::LockNotGranted {
            key: LockKey::Object(Oid::new(7)),
        };
        let deadlock = Error::Deadlock {
            key: LockKey::Object(Oid::new(7)),
        };
        assert!(not_granted.to_string().contains("not granted"));
        assert!(deadlock.to_string().contains("deadlock"));
        assert!(!not_granted.is_deadlock());
        assert!(deadlock.is_deadlock());
    }

    #[test]
    fn from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn object_not_found_carries_oid() {
        let err = Error::ObjectNotFound(Oid::new(99));
        assert!(err.to_string().contains("oid:99"));
    }
}
