//! Database engine for OrionDB
//!
//! This crate orchestrates the lower layers:
//! - `Coordinator`: the transaction/checkpoint protocol that ties the
//!   lock scheduler, redo log, and paged object store together under
//!   the write-ahead ordering invariant
//! - `UpdateCache`: process-wide cache of not-yet-flushed object
//!   images, shared by every session
//! - `Database`: open/close lifecycle, recovery on unclean volumes,
//!   and the process registry of open databases
//!
//! The engine is the only component that knows about cross-layer
//! ordering (log write before store write, checkpoint before lock
//! release).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod database;
pub mod transaction;
pub mod update_cache;

pub use coordinator::{Coordinator, StoreRequest};
pub use database::Database;
pub use transaction::{StorageTransaction, TxnState};
pub use update_cache::UpdateCache;
