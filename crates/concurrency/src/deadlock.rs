//! Deadlock detection.
//!
//! Both detectors run while the caller holds the scheduler monitor,
//! immediately before a request would enqueue to wait. Each call
//! owns its entire working state (worklist, visited set); nothing is
//! shared between detection passes.

use crate::arena::NIL;
use crate::scheduler::{compatible, LockMode, SchedState};
use rustc_hash::FxHashSet;

/// Exact detection: depth-first search over the waits-for graph.
///
/// Starting from the object the requester would block on, follow
/// "holder of this object is itself blocked on..." edges. A deadlock
/// exists when the traversal reaches the requester again after
/// following at least one such edge. The requester's own granted lock
/// on the starting object (a promotion request) is not a cycle.
pub(crate) fn waits_for_cycle(state: &SchedState, start_obj: u32, requester: u32) -> bool {
    let mut visited: FxHashSet<u32> = FxHashSet::default();
    // (object, reached over a wait-for edge)
    let mut worklist: Vec<(u32, bool)> = vec![(start_obj, false)];

    while let Some((obj, via_edge)) = worklist.pop() {
        let mut cur = state.objects[obj].granted_head;
        while cur != NIL {
            let holder = state.locks[cur].owner;
            if holder == requester {
                if via_edge {
                    return true;
                }
            } else if visited.insert(holder) {
                let blocked_on = state.txns[holder].blocked_on;
                if blocked_on != NIL {
                    worklist.push((blocked_on, true));
                }
            }
            cur = state.locks[cur].next_in_object;
        }
    }
    false
}

/// Conservative detection: timestamp ordering.
///
/// Every transaction carries a strictly increasing creation stamp. A
/// requester younger (larger stamp) than any transaction holding a
/// conflicting lock on the object is declared deadlocked. This
/// over-approximates: it can refuse a wait that would not actually
/// cycle, trading accuracy for a single pass over the granted list
/// instead of a graph traversal.
pub(crate) fn timestamp_conflict(
    state: &SchedState,
    obj: u32,
    requester: u32,
    mode: LockMode,
) -> bool {
    let my_stamp = state.txns[requester].stamp;
    let mut cur = state.objects[obj].granted_head;
    while cur != NIL {
        let lock = &state.locks[cur];
        if lock.owner != requester
            && !compatible(lock.mode, mode)
            && state.txns[lock.owner].stamp < my_stamp
        {
            return true;
        }
        cur = lock.next_in_object;
    }
    false
}
