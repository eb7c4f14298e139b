//! OrionDB - embedded object database
//!
//! OrionDB persists variably-sized serialized objects into fixed-size
//! pages on a volume, coordinates concurrent access with two-phase
//! locking and deadlock detection, and ties every update to a
//! write-ahead redo log so the checkpoint/commit protocol gives
//! crash-consistent durability.
//!
//! # Quick start
//!
//! ```
//! use oriondb::{Config, Database, StoreRequest, Cid};
//!
//! # fn main() -> oriondb::Result<()> {
//! // An in-memory database (nothing touches disk)
//! let db = Database::open(Config::default())?;
//!
//! let mut txn = db.begin()?;
//! let oid = db.new_oid_block(&txn, 1)?;
//! db.store_objects(&mut txn, vec![StoreRequest {
//!     oid,
//!     cid: Cid::new(64),
//!     image: b"serialized object bytes".to_vec(),
//! }])?;
//! db.commit(txn)?;
//!
//! let txn = db.begin()?;
//! let images = db.load_objects(&txn, &[oid])?;
//! assert_eq!(images[0], b"serialized object bytes");
//! db.rollback(txn)?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`orion_storage`]: the paged object store (on-page format,
//!   overflow chains, OID table, volumes)
//! - [`orion_concurrency`]: the lock scheduler (2PL, FIFO queues,
//!   deadlock detection)
//! - [`orion_durability`]: the redo log and recovery replay
//! - [`orion_engine`]: the transaction/checkpoint coordinator and
//!   database lifecycle
//!
//! Open a [`Database`] and work through its transaction API; the
//! lower layers are exposed for embedding and testing.

pub use orion_core::{
    AppendOutcome, BlockVolume, Cid, Config, DetectorKind, Error, LockKey, LogKind, LogPosition,
    ObjectPtr, Oid, RedoLog, RedoRecord, Result, TxnId, VolumeKind,
};

pub use orion_concurrency::{LockMode, LockScheduler, LockStats, WaitPolicy};
pub use orion_durability::{recover, FileRedoLog, MemoryRedoLog, RecoveryReport};
pub use orion_engine::{Coordinator, Database, StorageTransaction, StoreRequest, TxnState};
pub use orion_storage::{FileVolume, MemoryVolume, ObjectStore};
