//! Durability layer for OrionDB
//!
//! This crate handles everything that touches the redo log:
//!
//! - Binary record codec: length-prefixed, version-tagged,
//!   CRC32-trailed frames
//! - `MemoryRedoLog`: record list for tests and throwaway databases
//! - `FileRedoLog`: segmented append-only log files, rotated at a
//!   configured size, with durable flush on commit-class records
//! - Recovery: replay of committed transactions from the last
//!   complete database checkpoint into the paged object store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod log;
pub mod record;
pub mod recovery;

pub use log::{FileRedoLog, MemoryRedoLog};
pub use recovery::{recover, RecoveryReport};
