//! Database lifecycle.
//!
//! `Database::open` wires a volume, object store, lock scheduler, and
//! redo log together per the configuration, running recovery first
//! when the volume was not closed cleanly. `close` is the explicit,
//! deterministic shutdown; dropping the handle closes best-effort.
//!
//! A process-wide registry (one lazily initialized mutex-guarded map)
//! refuses to open the same file-backed database twice from one
//! process. There are no exit hooks; lifecycle is owned by this type.

use crate::coordinator::{Coordinator, StoreRequest};
use crate::transaction::StorageTransaction;
use once_cell::sync::Lazy;
use orion_concurrency::{LockScheduler, LockStats};
use orion_core::{
    BlockVolume, Config, Error, LogKind, Oid, RedoLog, Result, VolumeKind,
};
use orion_durability::{recover, FileRedoLog, MemoryRedoLog, RecoveryReport};
use orion_storage::{FileVolume, MemoryVolume, ObjectStore};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the volume inside a database directory.
const VOLUME_FILE: &str = "data.orn";
/// Directory holding redo-log segments inside a database directory.
const REDO_DIR: &str = "redo";

/// Open file-backed databases in this process, by canonical path.
static OPEN_DATABASES: Lazy<Mutex<FxHashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(FxHashSet::default()));

enum VolumeHandle {
    Memory(Arc<MemoryVolume>),
    File(Arc<FileVolume>),
}

/// An open OrionDB database.
pub struct Database {
    coordinator: Coordinator,
    volume: VolumeHandle,
    registry_key: Option<PathBuf>,
    closed: AtomicBool,
    recovery: Option<RecoveryReport>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("registry_key", &self.registry_key)
            .field("closed", &self.closed)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating or recovering as needed) a database described
    /// by `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        match config.volume {
            VolumeKind::Memory => Self::open_memory(config),
            VolumeKind::File => Self::open_file(config),
        }
    }

    fn open_memory(config: Config) -> Result<Self> {
        let volume = Arc::new(MemoryVolume::new(config.page_size, config.max_volume_pages));
        let store = Arc::new(ObjectStore::format(
            Arc::clone(&volume) as Arc<dyn BlockVolume>
        )?);
        let log: Arc<dyn RedoLog> = match config.redo_log {
            LogKind::Memory => Arc::new(MemoryRedoLog::new()),
            LogKind::File => {
                let path = config.path.as_ref().expect("validated");
                std::fs::create_dir_all(path)?;
                Arc::new(FileRedoLog::open(path.join(REDO_DIR), config.max_log_size)?)
            }
        };
        let scheduler = Arc::new(LockScheduler::new(config.detector));
        info!(target: "orion::db", "in-memory database opened");
        Ok(Database {
            coordinator: Coordinator::new(store, scheduler, log, &config),
            volume: VolumeHandle::Memory(volume),
            registry_key: None,
            closed: AtomicBool::new(false),
            recovery: None,
        })
    }

    fn open_file(config: Config) -> Result<Self> {
        let dir = config.path.clone().expect("validated");
        std::fs::create_dir_all(&dir)?;
        let key = dir.canonicalize()?;
        {
            let mut open = OPEN_DATABASES.lock();
            if !open.insert(key.clone()) {
                return Err(Error::AlreadyOpen(key.display().to_string()));
            }
        }
        // From here on, failures must give the registry slot back.
        match Self::open_file_registered(config, &dir) {
            Ok(mut database) => {
                database.registry_key = Some(key);
                Ok(database)
            }
            Err(err) => {
                OPEN_DATABASES.lock().remove(&key);
                Err(err)
            }
        }
    }

    fn open_file_registered(config: Config, dir: &std::path::Path) -> Result<Database> {
        let volume_path = dir.join(VOLUME_FILE);
        let log: Arc<dyn RedoLog> = match config.redo_log {
            LogKind::File => Arc::new(FileRedoLog::open(dir.join(REDO_DIR), config.max_log_size)?),
            LogKind::Memory => Arc::new(MemoryRedoLog::new()),
        };

        let (volume, store, recovery) = if volume_path.exists() {
            match FileVolume::open(&volume_path, config.max_volume_pages) {
                Ok(volume) => {
                    let volume = Arc::new(volume);
                    let store =
                        ObjectStore::open(Arc::clone(&volume) as Arc<dyn BlockVolume>)?;
                    (volume, Arc::new(store), None)
                }
                Err(Error::NeedsRecovery) => {
                    info!(target: "orion::db", path = %volume_path.display(), "unclean volume, recovering");
                    let volume =
                        Arc::new(FileVolume::open_unchecked(&volume_path, config.max_volume_pages)?);
                    let store = Arc::new(ObjectStore::open(
                        Arc::clone(&volume) as Arc<dyn BlockVolume>
                    )?);
                    let report = recover(&store, log.as_ref())?;
                    (volume, store, Some(report))
                }
                Err(err) => return Err(err),
            }
        } else {
            let volume = Arc::new(FileVolume::create(
                &volume_path,
                config.page_size,
                config.max_volume_pages,
            )?);
            let store = Arc::new(ObjectStore::format(
                Arc::clone(&volume) as Arc<dyn BlockVolume>
            )?);
            (volume, store, None)
        };

        if volume.page_size() != config.page_size {
            return Err(Error::InvalidConfig(format!(
                "volume has page size {}, configuration says {}",
                volume.page_size(),
                config.page_size
            )));
        }

        let scheduler = Arc::new(LockScheduler::new(config.detector));
        info!(target: "orion::db", path = %dir.display(), "database opened");
        Ok(Database {
            coordinator: Coordinator::new(store, scheduler, log, &config),
            volume: VolumeHandle::File(volume),
            registry_key: None,
            closed: AtomicBool::new(false),
            recovery,
        })
    }

    /// What recovery did at open time, if it ran.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Result<StorageTransaction> {
        self.check_open()?;
        self.coordinator.begin()
    }

    /// Allocate a block of fresh OIDs for `txn`.
    pub fn new_oid_block(&self, txn: &StorageTransaction, count: u64) -> Result<Oid> {
        self.check_open()?;
        self.coordinator.new_oid_block(txn, count)
    }

    /// Write objects under `txn`.
    pub fn store_objects(
        &self,
        txn: &mut StorageTransaction,
        objects: Vec<StoreRequest>,
    ) -> Result<()> {
        self.check_open()?;
        self.coordinator.store_objects(txn, objects)
    }

    /// Read objects under `txn`.
    pub fn load_objects(&self, txn: &StorageTransaction, oids: &[Oid]) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        self.coordinator.load_objects(txn, oids)
    }

    /// Flush `txn`'s pending writes without ending it.
    pub fn checkpoint(&self, txn: &mut StorageTransaction) -> Result<()> {
        self.check_open()?;
        self.coordinator.checkpoint(txn)
    }

    /// Commit `txn`.
    pub fn commit(&self, txn: StorageTransaction) -> Result<()> {
        self.check_open()?;
        self.coordinator.commit(txn)
    }

    /// Roll `txn` back.
    pub fn rollback(&self, txn: StorageTransaction) -> Result<()> {
        self.check_open()?;
        self.coordinator.rollback(txn)
    }

    /// Lock scheduler counters.
    pub fn lock_stats(&self) -> LockStats {
        self.coordinator.scheduler().stats()
    }

    /// Number of active transactions.
    pub fn active_transactions(&self) -> usize {
        self.coordinator.active_transactions()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Shut down deterministically: quiesce the coordinator, write the
    /// final checkpoint, mark the volume clean, release the registry
    /// slot. Idempotent; called by `Drop` if the caller forgot.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.coordinator.shutdown()?;
        match &self.volume {
            VolumeHandle::File(volume) => volume.close()?,
            VolumeHandle::Memory(volume) => volume.sync_all_pages()?,
        }
        if let Some(key) = &self.registry_key {
            OPEN_DATABASES.lock().remove(key);
        }
        debug!(target: "orion::db", "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(target: "orion::db", "close during drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_core::Cid;
    use tempfile::TempDir;

    #[test]
    fn memory_database_round_trip() {
        let db = Database::open(Config::default()).unwrap();
        let mut txn = db.begin().unwrap();
        let oid = db.new_oid_block(&txn, 1).unwrap();
        db.store_objects(
            &mut txn,
            vec![StoreRequest {
                oid,
                cid: Cid::new(64),
                image: b"hello".to_vec(),
            }],
        )
        .unwrap();
        assert_eq!(db.load_objects(&txn, &[oid]).unwrap(), vec![b"hello".to_vec()]);
        db.commit(txn).unwrap();

        let txn = db.begin().unwrap();
        assert_eq!(db.load_objects(&txn, &[oid]).unwrap(), vec![b"hello".to_vec()]);
        db.rollback(txn).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn double_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let config = Config::file(dir.path());
        let db = Database::open(config.clone()).unwrap();
        assert!(matches!(
            Database::open(config.clone()).unwrap_err(),
            Error::AlreadyOpen(_)
        ));
        db.close().unwrap();
        // Closing released the registry slot
        let db = Database::open(config).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn closed_database_refuses_operations() {
        let db = Database::open(Config::default()).unwrap();
        db.close().unwrap();
        assert!(matches!(db.begin().unwrap_err(), Error::NotConnected));
    }

    #[test]
    fn begin_after_shutdown_is_refused() {
        let db = Database::open(Config::default()).unwrap();
        let txn = db.begin().unwrap();
        // Shutdown with an open transaction force-rolls it back
        db.close().unwrap();
        assert!(db.commit(txn).is_err());
    }
}
