//! Process-wide cache of pending object images.
//!
//! Every not-yet-flushed write sits here keyed by OID, so loads
//! anywhere in the process see the most recent in-flight image
//! without touching the store. The cache has a byte budget: an image
//! that would push it over is dropped immediately and re-read from
//! its redo-log record on demand (the log position is always kept).

use orion_core::{Cid, LogPosition, Oid, TxnId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use tracing::trace;

/// One pending write.
#[derive(Debug, Clone)]
pub struct CachedUpdate {
    /// Transaction that produced the image.
    pub txn: TxnId,
    /// Class of the object.
    pub cid: Cid,
    /// The image, unless evicted to stay under the byte budget.
    pub image: Option<Vec<u8>>,
    /// Redo-log position of the STORE record this write came from;
    /// evicted images are re-derived from it.
    pub position: LogPosition,
}

struct CacheInner {
    map: FxHashMap<Oid, CachedUpdate>,
    bytes: usize,
}

/// Shared cache of pending updates, guarded by its own mutex.
pub struct UpdateCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

impl UpdateCache {
    /// Create a cache with the given byte budget and initial hash
    /// capacity.
    pub fn new(max_bytes: usize, capacity: usize) -> Self {
        UpdateCache {
            inner: Mutex::new(CacheInner {
                map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Insert or replace the pending image for `oid`. Returns whether
    /// the OID was already pending (a replace).
    pub fn insert(
        &self,
        oid: Oid,
        txn: TxnId,
        cid: Cid,
        image: Vec<u8>,
        position: LogPosition,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let replaced = match inner.map.entry(oid) {
            Entry::Occupied(mut occupied) => {
                let old = occupied.get_mut();
                let old_len = old.image.as_ref().map_or(0, Vec::len);
                *old = CachedUpdate {
                    txn,
                    cid,
                    image: None,
                    position,
                };
                inner.bytes -= old_len;
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CachedUpdate {
                    txn,
                    cid,
                    image: None,
                    position,
                });
                false
            }
        };
        // Keep the image only if the budget allows; otherwise it is
        // served from the log by position.
        if inner.bytes + image.len() <= self.max_bytes {
            inner.bytes += image.len();
            inner
                .map
                .get_mut(&oid)
                .expect("entry just inserted")
                .image = Some(image);
        } else {
            trace!(target: "orion::txn", %oid, len = image.len(), "image evicted from update cache");
        }
        replaced
    }

    /// Current pending image for `oid`, if any.
    pub fn lookup(&self, oid: Oid) -> Option<CachedUpdate> {
        self.inner.lock().map.get(&oid).cloned()
    }

    /// Remove and return the entry for `oid` if it belongs to `txn`.
    pub fn take(&self, oid: Oid, txn: TxnId) -> Option<CachedUpdate> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let owned = inner.map.get(&oid).map_or(false, |entry| entry.txn == txn);
        if !owned {
            return None;
        }
        let entry = inner.map.remove(&oid).expect("entry just observed");
        inner.bytes -= entry.image.as_ref().map_or(0, Vec::len);
        Some(entry)
    }

    /// Drop every entry belonging to `txn`.
    pub fn drop_transaction(&self, txn: TxnId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let doomed: Vec<Oid> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.txn == txn)
            .map(|(oid, _)| *oid)
            .collect();
        for oid in doomed {
            let entry = inner.map.remove(&oid).expect("key just collected");
            inner.bytes -= entry.image.as_ref().map_or(0, Vec::len);
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache holds no pending entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of cached images (excludes evicted entries).
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXN: TxnId = TxnId::new(1);
    const CID: Cid = Cid::new(64);

    fn cache() -> UpdateCache {
        UpdateCache::new(100, 16)
    }

    #[test]
    fn insert_lookup_take() {
        let cache = cache();
        let oid = Oid::new(10);
        cache.insert(oid, TXN, CID, vec![1, 2, 3], LogPosition::from_raw(5));
        let hit = cache.lookup(oid).unwrap();
        assert_eq!(hit.image.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(hit.position, LogPosition::from_raw(5));
        assert_eq!(cache.bytes(), 3);

        let taken = cache.take(oid, TXN).unwrap();
        assert_eq!(taken.cid, CID);
        assert!(cache.is_empty());
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn replace_swaps_image_and_position() {
        let cache = cache();
        let oid = Oid::new(10);
        cache.insert(oid, TXN, CID, vec![1; 10], LogPosition::from_raw(1));
        let replaced = cache.insert(oid, TXN, CID, vec![2; 20], LogPosition::from_raw(2));
        assert!(replaced);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 20);
        let hit = cache.lookup(oid).unwrap();
        assert_eq!(hit.image.as_deref(), Some(&[2u8; 20][..]));
        assert_eq!(hit.position, LogPosition::from_raw(2));
    }

    #[test]
    fn over_budget_image_is_evicted_but_entry_remains() {
        let cache = UpdateCache::new(10, 4);
        let big = Oid::new(1);
        cache.insert(big, TXN, CID, vec![0; 50], LogPosition::from_raw(7));
        let hit = cache.lookup(big).unwrap();
        assert!(hit.image.is_none(), "image past the budget is dropped");
        assert_eq!(hit.position, LogPosition::from_raw(7));
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn take_refuses_foreign_transaction() {
        let cache = cache();
        let oid = Oid::new(10);
        cache.insert(oid, TXN, CID, vec![1], LogPosition::from_raw(1));
        assert!(cache.take(oid, TxnId::new(2)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn drop_transaction_clears_only_its_entries() {
        let cache = cache();
        let other = TxnId::new(2);
        cache.insert(Oid::new(1), TXN, CID, vec![1], LogPosition::from_raw(1));
        cache.insert(Oid::new(2), other, CID, vec![2], LogPosition::from_raw(2));
        cache.insert(Oid::new(3), TXN, CID, vec![3], LogPosition::from_raw(3));
        cache.drop_transaction(TXN);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(Oid::new(2)).is_some());
    }
}
