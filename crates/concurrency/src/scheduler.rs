//! The lock scheduler.
//!
//! Two-phase locking over typed keys with FIFO wait queues. One
//! mutex (the monitor) guards all scheduler state; it is held only
//! for list mutation and detection passes, never across a suspension.
//! A blocked request waits on its transaction's condvar and is woken
//! by the transaction that released the conflicting lock, which
//! re-grants the lock on the waiter's behalf before waking it.

use crate::arena::{Arena, NIL};
use crate::deadlock;
use crate::stats::LockStats;
use orion_core::{DetectorKind, Error, LockKey, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lock mode; exclusivity strictly increases READ < UPGRADE < WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared read.
    Read,
    /// Read with intent to write; at most one per key, coexists with
    /// readers.
    Upgrade,
    /// Exclusive write.
    Write,
}

/// Compatibility of a requested mode against one granted lock.
///
/// Granted READ admits READ and UPGRADE; every other combination
/// conflicts, which is what keeps UPGRADE and WRITE singular per key.
pub fn compatible(granted: LockMode, requested: LockMode) -> bool {
    matches!(
        (granted, requested),
        (LockMode::Read, LockMode::Read) | (LockMode::Read, LockMode::Upgrade)
    )
}

/// How long a lock request is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Non-blocking probe: fail immediately instead of queueing.
    NoWait,
    /// Wait at most this long.
    Bounded(Duration),
    /// Wait until granted or deadlocked.
    Unbounded,
}

/// Handle to a scheduler transaction.
///
/// Carries a generation stamp so a handle kept across
/// `end_transaction` (including after a deadlock abort) is detected
/// instead of silently addressing a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHandle {
    idx: u32,
    generation: u32,
}

pub(crate) struct LockRecord {
    pub(crate) mode: LockMode,
    pub(crate) owner: u32,
    pub(crate) object: u32,
    pub(crate) granted: bool,
    /// Next on the object's granted list or wait queue (whichever
    /// this record is on).
    pub(crate) next_in_object: u32,
    /// Next on the owner's granted-lock list.
    pub(crate) next_in_owner: u32,
}

pub(crate) struct LockedObject {
    pub(crate) key: LockKey,
    pub(crate) granted_head: u32,
    pub(crate) wait_head: u32,
    pub(crate) wait_tail: u32,
    /// Cached most-exclusive granted mode; always equals the maximum
    /// over the granted list.
    pub(crate) max_mode: Option<LockMode>,
}

pub(crate) struct TxnSlot {
    /// Creation stamp for timestamp-ordering detection.
    pub(crate) stamp: u64,
    /// Object this transaction is currently blocked on, or NIL.
    pub(crate) blocked_on: u32,
    /// Head of the granted-lock list.
    pub(crate) lock_head: u32,
    /// Wakeup signal for this transaction's blocked request.
    pub(crate) wake: Arc<Condvar>,
}

pub(crate) struct SchedState {
    pub(crate) locks: Arena<LockRecord>,
    pub(crate) objects: Arena<LockedObject>,
    pub(crate) txns: Arena<TxnSlot>,
    pub(crate) by_key: FxHashMap<LockKey, u32>,
    /// Per-slot generation counters; grow-only so stale handles stay
    /// detectable after slot reuse.
    generations: Vec<u32>,
    next_stamp: u64,
    stats: LockStats,
}

impl SchedState {
    fn find_granted(&self, obj: u32, owner: u32) -> Option<u32> {
        let mut cur = self.objects[obj].granted_head;
        while cur != NIL {
            if self.locks[cur].owner == owner {
                return Some(cur);
            }
            cur = self.locks[cur].next_in_object;
        }
        None
    }

    /// Whether `owner` could hold `mode` given the other granted
    /// locks. The owner's own granted lock never conflicts with its
    /// promotion.
    fn grantable(&self, obj: u32, owner: u32, mode: LockMode) -> bool {
        let mut cur = self.objects[obj].granted_head;
        while cur != NIL {
            let lock = &self.locks[cur];
            if lock.owner != owner && !compatible(lock.mode, mode) {
                return false;
            }
            cur = lock.next_in_object;
        }
        true
    }

    fn recompute_max(&mut self, obj: u32) {
        let mut max: Option<LockMode> = None;
        let mut cur = self.objects[obj].granted_head;
        while cur != NIL {
            let mode = self.locks[cur].mode;
            max = Some(max.map_or(mode, |m: LockMode| m.max(mode)));
            cur = self.locks[cur].next_in_object;
        }
        self.objects[obj].max_mode = max;
    }

    fn push_granted(&mut self, obj: u32, lock_idx: u32) {
        let head = self.objects[obj].granted_head;
        self.locks[lock_idx].next_in_object = head;
        self.locks[lock_idx].granted = true;
        self.objects[obj].granted_head = lock_idx;
    }

    fn remove_granted(&mut self, obj: u32, lock_idx: u32) {
        let mut cur = self.objects[obj].granted_head;
        if cur == lock_idx {
            self.objects[obj].granted_head = self.locks[lock_idx].next_in_object;
            return;
        }
        while cur != NIL {
            let next = self.locks[cur].next_in_object;
            if next == lock_idx {
                self.locks[cur].next_in_object = self.locks[lock_idx].next_in_object;
                return;
            }
            cur = next;
        }
    }

    fn push_wait_tail(&mut self, obj: u32, lock_idx: u32) {
        self.locks[lock_idx].next_in_object = NIL;
        let tail = self.objects[obj].wait_tail;
        if tail == NIL {
            self.objects[obj].wait_head = lock_idx;
        } else {
            self.locks[tail].next_in_object = lock_idx;
        }
        self.objects[obj].wait_tail = lock_idx;
    }

    fn pop_wait_head(&mut self, obj: u32) -> u32 {
        let head = self.objects[obj].wait_head;
        debug_assert!(head != NIL);
        let next = self.locks[head].next_in_object;
        self.objects[obj].wait_head = next;
        if next == NIL {
            self.objects[obj].wait_tail = NIL;
        }
        self.locks[head].next_in_object = NIL;
        head
    }

    fn remove_waiter(&mut self, obj: u32, lock_idx: u32) {
        if self.objects[obj].wait_head == lock_idx {
            self.pop_wait_head(obj);
            return;
        }
        let mut cur = self.objects[obj].wait_head;
        while cur != NIL {
            let next = self.locks[cur].next_in_object;
            if next == lock_idx {
                self.locks[cur].next_in_object = self.locks[lock_idx].next_in_object;
                if self.objects[obj].wait_tail == lock_idx {
                    self.objects[obj].wait_tail = cur;
                }
                return;
            }
            cur = next;
        }
    }

    fn push_owner(&mut self, txn: u32, lock_idx: u32) {
        let head = self.txns[txn].lock_head;
        self.locks[lock_idx].next_in_owner = head;
        self.txns[txn].lock_head = lock_idx;
    }

    /// Drop a key's state once it has neither granted locks nor
    /// waiters.
    fn cleanup_object(&mut self, obj: u32) {
        let object = &self.objects[obj];
        if object.granted_head == NIL && object.wait_head == NIL {
            let key = object.key;
            self.by_key.remove(&key);
            self.objects.remove(obj);
        }
    }

    /// Retry FIFO waiters after a release: grant from the head of the
    /// queue for as long as each head waiter is satisfiable, waking
    /// every newly granted owner. Stops at the first waiter that still
    /// conflicts; nothing is granted past it.
    fn process_waiters(&mut self, obj: u32) {
        loop {
            let head = self.objects[obj].wait_head;
            if head == NIL {
                return;
            }
            let (owner, mode) = {
                let lock = &self.locks[head];
                (lock.owner, lock.mode)
            };
            if !self.grantable(obj, owner, mode) {
                return;
            }
            self.pop_wait_head(obj);
            match self.find_granted(obj, owner) {
                Some(existing) => {
                    // Waiting promotion: raise the existing lock and
                    // leave the wait record floating, granted, for the
                    // woken thread to reap.
                    self.locks[existing].mode = mode;
                    self.locks[head].granted = true;
                }
                None => {
                    self.push_granted(obj, head);
                    self.push_owner(owner, head);
                }
            }
            self.recompute_max(obj);
            self.txns[owner].blocked_on = NIL;
            self.txns[owner].wake.notify_one();
            trace!(target: "orion::lock", owner, ?mode, "waiter granted");
        }
    }

    fn note_peaks(&mut self) {
        let (t, o, l) = (self.txns.len(), self.objects.len(), self.locks.len());
        self.stats.note_peaks(t, o, l);
    }
}

/// Two-phase-locking scheduler with FIFO wait queues.
pub struct LockScheduler {
    detector: DetectorKind,
    state: Mutex<SchedState>,
}

impl LockScheduler {
    /// Create a scheduler using the given deadlock detector.
    pub fn new(detector: DetectorKind) -> Self {
        LockScheduler {
            detector,
            state: Mutex::new(SchedState {
                locks: Arena::default(),
                objects: Arena::default(),
                txns: Arena::default(),
                by_key: FxHashMap::default(),
                generations: Vec::new(),
                next_stamp: 0,
                stats: LockStats::default(),
            }),
        }
    }

    /// Start a scheduler transaction.
    pub fn start_transaction(&self) -> TxnHandle {
        let mut state = self.state.lock();
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        let idx = state.txns.insert(TxnSlot {
            stamp,
            blocked_on: NIL,
            lock_head: NIL,
            wake: Arc::new(Condvar::new()),
        });
        if state.generations.len() <= idx as usize {
            state.generations.resize(idx as usize + 1, 0);
        }
        state.note_peaks();
        let generation = state.generations[idx as usize];
        trace!(target: "orion::lock", idx, stamp, "transaction started");
        TxnHandle { idx, generation }
    }

    fn check_handle(&self, state: &SchedState, txn: TxnHandle) -> Result<()> {
        let live = state.txns.get(txn.idx).is_some()
            && state.generations[txn.idx as usize] == txn.generation;
        if live {
            Ok(())
        } else {
            Err(Error::TransactionNotInProgress)
        }
    }

    /// Acquire `mode` on `key` for `txn`, waiting per `wait`.
    ///
    /// Re-requesting a mode at or below one already held succeeds
    /// without changing the held mode (a lock is never downgraded).
    /// A more exclusive re-request is a promotion. New requests honor
    /// strict FIFO: while other waiters are queued on the key, a new
    /// request queues behind them even if it would be individually
    /// compatible.
    pub fn lock(
        &self,
        txn: TxnHandle,
        key: LockKey,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<()> {
        let started = Instant::now();
        let mut state = self.state.lock();
        self.check_handle(&state, txn)?;
        state.stats.attempts += 1;

        let obj = match state.by_key.get(&key) {
            Some(&obj) => obj,
            None => {
                let obj = state.objects.insert(LockedObject {
                    key,
                    granted_head: NIL,
                    wait_head: NIL,
                    wait_tail: NIL,
                    max_mode: None,
                });
                state.by_key.insert(key, obj);
                obj
            }
        };

        if let Some(held_idx) = state.find_granted(obj, txn.idx) {
            let held = state.locks[held_idx].mode;
            if mode <= held {
                // Same or less exclusive: no-op, never downgrade.
                state.stats.grants += 1;
                return Ok(());
            }
            // Promotion. Unlike a new request it does not queue behind
            // waiters: the holder is already inside the granted set.
            if state.grantable(obj, txn.idx, mode) {
                state.locks[held_idx].mode = mode;
                state.recompute_max(obj);
                state.stats.grants += 1;
                trace!(target: "orion::lock", txn = txn.idx, %key, ?mode, "promoted");
                return Ok(());
            }
            return self.wait_for_lock(state, txn, key, obj, mode, wait, true, started);
        }

        // New request. The fast path needs both an empty wait queue
        // (FIFO: nothing may overtake a queued waiter) and
        // compatibility with every granted lock. The cached max mode
        // answers the common case without walking the list.
        let queue_empty = state.objects[obj].wait_head == NIL;
        let cache_ok = match state.objects[obj].max_mode {
            None => true,
            Some(max) => compatible(max, mode),
        };
        if queue_empty && (cache_ok || state.grantable(obj, txn.idx, mode)) {
            let lock_idx = state.locks.insert(LockRecord {
                mode,
                owner: txn.idx,
                object: obj,
                granted: false,
                next_in_object: NIL,
                next_in_owner: NIL,
            });
            state.push_granted(obj, lock_idx);
            state.push_owner(txn.idx, lock_idx);
            state.recompute_max(obj);
            state.note_peaks();
            state.stats.grants += 1;
            trace!(target: "orion::lock", txn = txn.idx, %key, ?mode, "granted");
            return Ok(());
        }

        self.wait_for_lock(state, txn, key, obj, mode, wait, false, started)
    }

    /// Queue the request and suspend until granted, timed out, or
    /// refused by deadlock detection.
    #[allow(clippy::too_many_arguments)]
    fn wait_for_lock(
        &self,
        mut state: MutexGuard<'_, SchedState>,
        txn: TxnHandle,
        key: LockKey,
        obj: u32,
        mode: LockMode,
        wait: WaitPolicy,
        promoting: bool,
        started: Instant,
    ) -> Result<()> {
        if wait == WaitPolicy::NoWait {
            state.cleanup_object(obj);
            return Err(Error::LockNotGranted { key });
        }

        let detect_started = Instant::now();
        let doomed = match self.detector {
            DetectorKind::WaitForGraph => deadlock::waits_for_cycle(&state, obj, txn.idx),
            DetectorKind::Timestamps => deadlock::timestamp_conflict(&state, obj, txn.idx, mode),
        };
        state.stats.note_detection(detect_started.elapsed());
        if doomed {
            state.stats.deadlocks += 1;
            state.cleanup_object(obj);
            debug!(target: "orion::lock", txn = txn.idx, %key, ?mode, "deadlock refused");
            return Err(Error::Deadlock { key });
        }

        state.stats.waits += 1;
        let lock_idx = state.locks.insert(LockRecord {
            mode,
            owner: txn.idx,
            object: obj,
            granted: false,
            next_in_object: NIL,
            next_in_owner: NIL,
        });
        state.push_wait_tail(obj, lock_idx);
        state.txns[txn.idx].blocked_on = obj;
        state.note_peaks();
        let wake = Arc::clone(&state.txns[txn.idx].wake);
        let deadline = match wait {
            WaitPolicy::Bounded(d) => Some(started + d),
            _ => None,
        };
        trace!(target: "orion::lock", txn = txn.idx, %key, ?mode, "suspended");

        let granted = loop {
            if state.locks.get(lock_idx).map_or(false, |l| l.granted) {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if wake.wait_until(&mut state, deadline).timed_out() {
                        // A grant can land exactly as the wait times
                        // out; the grant wins.
                        break state.locks.get(lock_idx).map_or(false, |l| l.granted);
                    }
                }
                None => wake.wait(&mut state),
            }
        };

        state.txns[txn.idx].blocked_on = NIL;
        if granted {
            if promoting {
                // The wait record served only as the queue entry; the
                // promotion was applied to the original granted lock.
                state.locks.remove(lock_idx);
            }
            state.stats.grants += 1;
            state.stats.note_wait(started.elapsed());
            return Ok(());
        }

        // Timed out: pull the queue entry so it cannot block waiters
        // behind it, then report an ordinary refusal.
        state.remove_waiter(obj, lock_idx);
        state.locks.remove(lock_idx);
        state.cleanup_object(obj);
        state.stats.note_wait(started.elapsed());
        debug!(target: "orion::lock", txn = txn.idx, %key, ?mode, "wait timed out");
        Err(Error::LockNotGranted { key })
    }

    /// Release every lock `txn` holds, retry waiters on each affected
    /// key in FIFO order, and retire the transaction. The handle is
    /// dead afterwards; this is the "all released together" half of
    /// two-phase locking.
    pub fn end_transaction(&self, txn: TxnHandle) -> Result<()> {
        let mut state = self.state.lock();
        self.check_handle(&state, txn)?;

        let mut affected: SmallVec<[u32; 8]> = SmallVec::new();
        let mut cur = state.txns[txn.idx].lock_head;
        while cur != NIL {
            let next = state.locks[cur].next_in_owner;
            let obj = state.locks[cur].object;
            state.remove_granted(obj, cur);
            state.locks.remove(cur);
            affected.push(obj);
            cur = next;
        }
        state.txns[txn.idx].lock_head = NIL;

        for &obj in &affected {
            state.recompute_max(obj);
            state.process_waiters(obj);
            state.cleanup_object(obj);
        }

        state.txns.remove(txn.idx);
        state.generations[txn.idx as usize] += 1;
        debug!(target: "orion::lock", txn = txn.idx, released = affected.len(), "transaction ended");
        Ok(())
    }

    /// Cumulative counters since the scheduler was created.
    pub fn stats(&self) -> LockStats {
        self.state.lock().stats.clone()
    }

    /// Number of live transactions.
    pub fn active_transactions(&self) -> usize {
        self.state.lock().txns.len()
    }

    /// Number of keys that currently carry lock state.
    pub fn locked_objects(&self) -> usize {
        self.state.lock().objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_core::Oid;

    fn key(n: u64) -> LockKey {
        LockKey::Object(Oid::new(n))
    }

    fn scheduler() -> LockScheduler {
        LockScheduler::new(DetectorKind::WaitForGraph)
    }

    #[test]
    fn uncontended_grant() {
        let s = scheduler();
        let t = s.start_transaction();
        s.lock(t, key(1), LockMode::Write, WaitPolicy::NoWait).unwrap();
        s.end_transaction(t).unwrap();
        assert_eq!(s.locked_objects(), 0, "empty keys are dropped");
    }

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        let cases = [
            (Read, Read, true),
            (Read, Upgrade, true),
            (Read, Write, false),
            (Upgrade, Read, false),
            (Upgrade, Upgrade, false),
            (Upgrade, Write, false),
            (Write, Read, false),
            (Write, Upgrade, false),
            (Write, Write, false),
        ];
        for (granted, requested, expect) in cases {
            assert_eq!(
                compatible(granted, requested),
                expect,
                "granted {granted:?}, requested {requested:?}"
            );
            // The scheduler agrees with the pure function
            let s = scheduler();
            let a = s.start_transaction();
            let b = s.start_transaction();
            s.lock(a, key(1), granted, WaitPolicy::NoWait).unwrap();
            let outcome = s.lock(b, key(1), requested, WaitPolicy::NoWait);
            assert_eq!(outcome.is_ok(), expect, "granted {granted:?}, requested {requested:?}");
        }
    }

    #[test]
    fn same_mode_re_request_is_noop() {
        let s = scheduler();
        let t = s.start_transaction();
        s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.end_transaction(t).unwrap();
    }

    #[test]
    fn never_downgrades() {
        let s = scheduler();
        let t = s.start_transaction();
        s.lock(t, key(1), LockMode::Write, WaitPolicy::NoWait).unwrap();
        // Less exclusive request succeeds but the write lock stands:
        // another reader still conflicts.
        s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        let other = s.start_transaction();
        assert!(s
            .lock(other, key(1), LockMode::Read, WaitPolicy::NoWait)
            .is_err());
    }

    #[test]
    fn single_holder_promotes_read_to_write() {
        let s = scheduler();
        let t = s.start_transaction();
        s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.lock(t, key(1), LockMode::Write, WaitPolicy::NoWait).unwrap();
        let other = s.start_transaction();
        assert!(s
            .lock(other, key(1), LockMode::Read, WaitPolicy::NoWait)
            .is_err());
    }

    #[test]
    fn promotion_blocked_by_second_reader() {
        let s = scheduler();
        let a = s.start_transaction();
        let b = s.start_transaction();
        s.lock(a, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.lock(b, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        assert!(matches!(
            s.lock(a, key(1), LockMode::Write, WaitPolicy::NoWait).unwrap_err(),
            Error::LockNotGranted { .. }
        ));
    }

    #[test]
    fn upgrade_coexists_with_readers_but_is_singular() {
        let s = scheduler();
        let a = s.start_transaction();
        let b = s.start_transaction();
        let c = s.start_transaction();
        s.lock(a, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.lock(b, key(1), LockMode::Upgrade, WaitPolicy::NoWait).unwrap();
        assert!(s
            .lock(c, key(1), LockMode::Upgrade, WaitPolicy::NoWait)
            .is_err());
    }

    #[test]
    fn nowait_probe_fails_without_queueing() {
        let s = scheduler();
        let writer = s.start_transaction();
        let reader = s.start_transaction();
        s.lock(writer, key(1), LockMode::Write, WaitPolicy::NoWait).unwrap();
        assert!(matches!(
            s.lock(reader, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap_err(),
            Error::LockNotGranted { .. }
        ));
        // The probe left nothing queued: releasing the writer leaves
        // the key with no state at all.
        s.end_transaction(writer).unwrap();
        assert_eq!(s.locked_objects(), 0);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let s = scheduler();
        let t = s.start_transaction();
        s.end_transaction(t).unwrap();
        assert!(matches!(
            s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap_err(),
            Error::TransactionNotInProgress
        ));
        assert!(s.end_transaction(t).is_err());
    }

    #[test]
    fn stats_count_grants_and_attempts() {
        let s = scheduler();
        let t = s.start_transaction();
        s.lock(t, key(1), LockMode::Read, WaitPolicy::NoWait).unwrap();
        s.lock(t, key(2), LockMode::Write, WaitPolicy::NoWait).unwrap();
        let other = s.start_transaction();
        let _ = s.lock(other, key(2), LockMode::Read, WaitPolicy::NoWait);
        let stats = s.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.grants, 2);
        assert_eq!(stats.peak_transactions, 2);
        assert!(stats.peak_locks >= 2);
    }
}
