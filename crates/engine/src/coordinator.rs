//! Transaction / checkpoint coordinator.
//!
//! Gives each session a locked, write-ahead-logged view of the paged
//! object store while serving reads of in-flight writes from the
//! shared update cache.
//!
//! The one ordering rule everything here protects: a STORE record is
//! appended to the redo log *before* the write becomes visible in the
//! update cache, and long before the page mutation reaches the store.
//! Checkpoints flush pending writes without releasing locks; commit
//! and rollback are terminal and release everything.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. append COMMIT to the redo log (durable - the commit point)
//! 2. flush pending images to the object store
//! 3. deregister from the active set
//! 4. trigger a database checkpoint if the policy says so
//! 5. end the scheduler transaction (release all locks)
//! ```
//!
//! If a crash lands between 1 and 2, recovery replays the images from
//! the log; the outcome is the same as if the crash had not occurred.

use crate::transaction::{StorageTransaction, TxnState};
use crate::update_cache::UpdateCache;
use dashmap::DashMap;
use orion_concurrency::{LockMode, LockScheduler, WaitPolicy};
use orion_core::{
    Cid, Config, Error, LockKey, LogPosition, Oid, RedoLog, RedoRecord, Result, TxnId,
};
use orion_storage::ObjectStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One object write handed to [`Coordinator::store_objects`].
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Object to write.
    pub oid: Oid,
    /// Class of the object.
    pub cid: Cid,
    /// Serialized image.
    pub image: Vec<u8>,
}

struct ActiveTxn {
    /// Replay start position (BEGIN, or the latest CHECKPOINT).
    start_position: LogPosition,
    lock: orion_concurrency::TxnHandle,
}

struct CheckpointClock {
    last: Instant,
}

/// The transaction/checkpoint coordinator.
pub struct Coordinator {
    store: Arc<ObjectStore>,
    scheduler: Arc<LockScheduler>,
    log: Arc<dyn RedoLog>,
    cache: UpdateCache,
    active: DashMap<TxnId, ActiveTxn>,
    quiescing: AtomicBool,
    lock_wait: WaitPolicy,
    checkpoint_active_threshold: usize,
    checkpoint_min_interval: Duration,
    /// Serializes database checkpoints; a finisher that triggers one
    /// while another is running queues on this mutex and waits.
    checkpoint_clock: Mutex<CheckpointClock>,
}

impl Coordinator {
    /// Wire a coordinator over the given store, scheduler, and log.
    pub fn new(
        store: Arc<ObjectStore>,
        scheduler: Arc<LockScheduler>,
        log: Arc<dyn RedoLog>,
        config: &Config,
    ) -> Self {
        let lock_wait = match config.lock_wait() {
            Some(wait) if wait.is_zero() => WaitPolicy::NoWait,
            Some(wait) => WaitPolicy::Bounded(wait),
            None => WaitPolicy::Unbounded,
        };
        Coordinator {
            store,
            scheduler,
            log,
            cache: UpdateCache::new(config.update_cache_max_bytes, config.update_cache_capacity),
            active: DashMap::new(),
            quiescing: AtomicBool::new(false),
            lock_wait,
            checkpoint_active_threshold: config.checkpoint_active_threshold,
            checkpoint_min_interval: config.checkpoint_min_interval(),
            checkpoint_clock: Mutex::new(CheckpointClock {
                last: Instant::now(),
            }),
        }
    }

    /// The paged object store this coordinator writes through.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The lock scheduler (for stats).
    pub fn scheduler(&self) -> &Arc<LockScheduler> {
        &self.scheduler
    }

    /// Number of active transactions.
    pub fn active_transactions(&self) -> usize {
        self.active.len()
    }

    /// Begin a transaction: BEGIN record (which assigns the id), a
    /// scheduler transaction, and registration in the active set.
    /// Refused while the database is quiescing for shutdown.
    pub fn begin(&self) -> Result<StorageTransaction> {
        if self.quiescing.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let outcome = self.log.append(&RedoRecord::Begin {
            txn: TxnId::UNASSIGNED,
        })?;
        let txn_id = outcome.assigned_txn.expect("BEGIN always assigns an id");
        let lock = self.scheduler.start_transaction();
        self.active.insert(
            txn_id,
            ActiveTxn {
                start_position: outcome.position,
                lock,
            },
        );
        debug!(target: "orion::txn", %txn_id, "transaction begun");
        Ok(StorageTransaction::new(txn_id, lock, outcome.position))
    }

    /// Allocate a block of fresh OIDs under the transaction's
    /// OID-table lock.
    pub fn new_oid_block(&self, txn: &StorageTransaction, count: u64) -> Result<Oid> {
        txn.check_active()?;
        self.scheduler
            .lock(txn.lock, LockKey::OidTable, LockMode::Write, self.lock_wait)?;
        self.store.new_oid_block(count)
    }

    /// Write objects: WRITE lock, STORE record, then the update cache.
    /// The log append strictly precedes the cache insert; redo
    /// correctness depends on that order.
    pub fn store_objects(
        &self,
        txn: &mut StorageTransaction,
        objects: Vec<StoreRequest>,
    ) -> Result<()> {
        txn.check_active()?;
        for request in objects {
            if request.oid.is_null() {
                return Err(Error::ObjectNotFound(request.oid));
            }
            self.scheduler.lock(
                txn.lock,
                LockKey::Object(request.oid),
                LockMode::Write,
                self.lock_wait,
            )?;
            let outcome = self.log.append(&RedoRecord::Store {
                txn: txn.txn_id,
                oid: request.oid,
                cid: request.cid,
                image: request.image.clone(),
            })?;
            let replaced = self.cache.insert(
                request.oid,
                txn.txn_id,
                request.cid,
                request.image,
                outcome.position,
            );
            if !replaced {
                txn.pending.push(request.oid);
            }
        }
        Ok(())
    }

    /// Read objects. The update cache is consulted first and serves
    /// the most recent in-flight image (re-read from the log if it
    /// was evicted); only on a miss is a READ lock taken and the
    /// store consulted.
    pub fn load_objects(&self, txn: &StorageTransaction, oids: &[Oid]) -> Result<Vec<Vec<u8>>> {
        txn.check_active()?;
        let mut out = Vec::with_capacity(oids.len());
        for &oid in oids {
            if let Some(cached) = self.cache.lookup(oid) {
                let image = match cached.image {
                    Some(image) => image,
                    None => self.reread_image(cached.position)?,
                };
                out.push(image);
                continue;
            }
            self.scheduler
                .lock(txn.lock, LockKey::Object(oid), LockMode::Read, self.lock_wait)?;
            out.push(self.store.load(oid)?);
        }
        Ok(out)
    }

    /// Recover an evicted image from its STORE record.
    fn reread_image(&self, position: LogPosition) -> Result<Vec<u8>> {
        match self.log.read(position)? {
            RedoRecord::Store { image, .. } => Ok(image),
            other => Err(Error::corrupt(format!(
                "update cache points at a non-store record at {position}: {other:?}"
            ))),
        }
    }

    /// Flush the transaction's pending writes to the object store and
    /// clear them from the cache and the pending list.
    fn flush_pending(&self, txn: &mut StorageTransaction) -> Result<()> {
        for oid in std::mem::take(&mut txn.pending) {
            let Some(entry) = self.cache.take(oid, txn.txn_id) else {
                // Already flushed by an earlier checkpoint pass.
                continue;
            };
            let image = match entry.image {
                Some(image) => image,
                None => self.reread_image(entry.position)?,
            };
            self.store.ensure_oid_allocated(oid)?;
            self.store.store(entry.cid, oid, &image)?;
        }
        Ok(())
    }

    /// Transaction checkpoint: CHECKPOINT record, then flush pending
    /// writes. Locks stay held; the transaction remains active, and
    /// recovery thereafter replays it from the CHECKPOINT record.
    pub fn checkpoint(&self, txn: &mut StorageTransaction) -> Result<()> {
        txn.check_active()?;
        self.ensure_registered(txn)?;
        let outcome = self.log.append(&RedoRecord::Checkpoint { txn: txn.txn_id })?;
        self.flush_pending(txn)?;
        txn.start_position = outcome.position;
        if let Some(mut entry) = self.active.get_mut(&txn.txn_id) {
            entry.start_position = outcome.position;
        }
        debug!(target: "orion::txn", txn_id = %txn.txn_id, "transaction checkpointed");
        Ok(())
    }

    /// Commit: COMMIT record (durable), flush pending writes, then
    /// finish (deregister, maybe checkpoint the database, release
    /// locks).
    pub fn commit(&self, mut txn: StorageTransaction) -> Result<()> {
        txn.check_active()?;
        self.ensure_registered(&txn)?;
        self.log.append(&RedoRecord::Commit { txn: txn.txn_id })?;
        self.flush_pending(&mut txn)?;
        txn.state = TxnState::Committed;
        self.finish(&txn);
        debug!(target: "orion::txn", txn_id = %txn.txn_id, "transaction committed");
        Ok(())
    }

    /// Rollback: ROLLBACK record, discard pending writes from the
    /// cache, then finish.
    pub fn rollback(&self, mut txn: StorageTransaction) -> Result<()> {
        txn.check_active()?;
        self.ensure_registered(&txn)?;
        self.log.append(&RedoRecord::Rollback { txn: txn.txn_id })?;
        self.cache.drop_transaction(txn.txn_id);
        txn.pending.clear();
        txn.state = TxnState::Aborted;
        self.finish(&txn);
        debug!(target: "orion::txn", txn_id = %txn.txn_id, "transaction rolled back");
        Ok(())
    }

    /// A transaction force-rolled-back by shutdown is gone from the
    /// active set; its session's later commit/rollback must fail
    /// rather than half-run.
    fn ensure_registered(&self, txn: &StorageTransaction) -> Result<()> {
        if self.active.contains_key(&txn.txn_id) {
            Ok(())
        } else {
            Err(Error::TransactionNotInProgress)
        }
    }

    fn finish(&self, txn: &StorageTransaction) {
        self.active.remove(&txn.txn_id);
        if let Err(err) = self.maybe_database_checkpoint(false) {
            warn!(target: "orion::txn", "database checkpoint failed: {err}");
        }
        // Locks are released only after the checkpoint decision, per
        // the protocol: the ending transaction's writes must be on
        // disk before anyone else can lock its objects.
        if let Err(err) = self.scheduler.end_transaction(txn.lock) {
            warn!(target: "orion::txn", txn_id = %txn.txn_id, "lock release failed: {err}");
        }
    }

    /// Write a database checkpoint when the policy allows: no other
    /// transactions remain, or few enough remain and the minimum
    /// interval has elapsed. `force` skips the policy (shutdown).
    fn maybe_database_checkpoint(&self, force: bool) -> Result<()> {
        let mut clock = self.checkpoint_clock.lock();
        let due = force
            || self.active.is_empty()
            || (self.active.len() < self.checkpoint_active_threshold
                && clock.last.elapsed() >= self.checkpoint_min_interval);
        if !due {
            return Ok(());
        }

        let active: Vec<(TxnId, LogPosition)> = self
            .active
            .iter()
            .map(|entry| (*entry.key(), entry.value().start_position))
            .collect();
        self.log
            .append(&RedoRecord::StartDbCheckpoint { active })?;
        // Everything logged and stored so far must be durable before
        // the END record claims the checkpoint is complete.
        self.log.sync()?;
        self.store.sync()?;
        self.log.append(&RedoRecord::EndDbCheckpoint)?;
        clock.last = Instant::now();
        info!(target: "orion::txn", still_active = self.active.len(), "database checkpoint");
        Ok(())
    }

    /// Quiesce and shut down: refuse new transactions, force-rollback
    /// whatever is still active, write a final clean checkpoint, then
    /// disconnect the store, the scheduler, and the log, in that
    /// order.
    pub fn shutdown(&self) -> Result<()> {
        self.quiescing.store(true, Ordering::Release);

        let abandoned: Vec<TxnId> = self.active.iter().map(|entry| *entry.key()).collect();
        for txn_id in abandoned {
            let Some((_, entry)) = self.active.remove(&txn_id) else {
                continue;
            };
            warn!(target: "orion::txn", %txn_id, "open transaction rolled back by shutdown");
            self.log.append(&RedoRecord::Rollback { txn: txn_id })?;
            self.cache.drop_transaction(txn_id);
            if let Err(err) = self.scheduler.end_transaction(entry.lock) {
                warn!(target: "orion::txn", %txn_id, "lock release failed: {err}");
            }
        }
        debug_assert_eq!(self.active.len(), 0);

        self.maybe_database_checkpoint(true)?;
        self.store.sync()?;
        self.log.sync()?;
        info!(target: "orion::txn", "coordinator shut down");
        Ok(())
    }
}
