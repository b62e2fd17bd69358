//! Striped lock table of one column family.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::util::hash::slice_hash;

use super::TransactionId;

/// Holders of one locked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockInfo {
    /// Every holder appears once. An exclusive lock has exactly one holder.
    pub txn_ids: Vec<TransactionId>,
    pub exclusive: bool,
    /// Microsecond deadline after which the lock may be stolen, 0 for never.
    pub expiration_time: u64,
}

impl LockInfo {
    pub fn new(txn_id: TransactionId, expiration_time: u64, exclusive: bool) -> Self {
        Self {
            txn_ids: vec![txn_id],
            exclusive,
            expiration_time,
        }
    }

    pub fn holds(&self, txn_id: TransactionId) -> bool {
        self.txn_ids.contains(&txn_id)
    }

    /// Remove `txn_id` from the holders. Returns true if it was one.
    pub fn remove_holder(&mut self, txn_id: TransactionId) -> bool {
        match self.txn_ids.iter().position(|id| *id == txn_id) {
            Some(pos) => {
                self.txn_ids.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

/// State guarded by a stripe mutex.
#[derive(Debug, Default)]
pub(crate) struct StripeState {
    pub keys: HashMap<Bytes, LockInfo>,
    /// Set once the stripe was replaced by a resize. Its keys live in the
    /// new table and callers must reload it.
    pub retired: bool,
}

/// One partition of a column family's lock table.
#[derive(Debug, Default)]
pub(crate) struct LockMapStripe {
    pub state: Mutex<StripeState>,
    /// Signalled whenever a key in this stripe is unlocked.
    pub cv: Condvar,
}

impl LockMapStripe {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) type StripeTable = Vec<Arc<LockMapStripe>>;

/// Locked keys of one column family.
pub(crate) struct LockMap {
    stripes: ArcSwap<StripeTable>,
    /// Number of locked keys across all stripes.
    pub lock_cnt: AtomicI64,
}

pub(crate) fn stripe_index(key: &[u8], num_stripes: usize) -> usize {
    slice_hash(key) as usize % num_stripes
}

fn new_table(num_stripes: usize) -> StripeTable {
    (0..num_stripes).map(|_| Arc::new(LockMapStripe::new())).collect()
}

impl LockMap {
    pub fn new(num_stripes: usize) -> Self {
        Self {
            stripes: ArcSwap::from_pointee(new_table(num_stripes.max(1))),
            lock_cnt: AtomicI64::new(0),
        }
    }

    /// Current stripe table.
    pub fn table(&self) -> Arc<StripeTable> {
        self.stripes.load_full()
    }

    pub fn num_stripes(&self) -> usize {
        self.stripes.load().len()
    }

    /// Stripe currently owning `key`. May be retired by the time it is locked.
    pub fn stripe_for(&self, key: &[u8]) -> Arc<LockMapStripe> {
        let table = self.stripes.load();
        Arc::clone(&table[stripe_index(key, table.len())])
    }

    pub fn lock_count(&self) -> i64 {
        self.lock_cnt.load(Ordering::Acquire)
    }

    /// Replace the stripe table with one of `num_stripes` stripes.
    ///
    /// Every old stripe is locked in ascending order for the duration of the
    /// swap, so no lock operation observes a half-moved key. Callers must
    /// serialize resizes of the same map.
    pub fn resize(&self, num_stripes: usize) {
        let num_stripes = num_stripes.max(1);
        let old = self.stripes.load_full();
        let mut guards: Vec<_> = old.iter().map(|stripe| stripe.state.lock()).collect();

        let table = new_table(num_stripes);
        for guard in guards.iter_mut() {
            for (key, info) in guard.keys.drain() {
                let idx = stripe_index(&key, num_stripes);
                table[idx].state.lock().keys.insert(key, info);
            }
            guard.retired = true;
        }
        self.stripes.store(Arc::new(table));

        drop(guards);
        for stripe in old.iter() {
            stripe.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_holders() {
        let mut info = LockInfo::new(1, 0, false);
        info.txn_ids.push(2);
        assert!(info.holds(1));
        assert!(info.remove_holder(1));
        assert!(!info.remove_holder(1));
        assert_eq!(info.txn_ids, vec![2]);
    }

    #[test]
    fn test_stripe_for_is_stable() {
        let map = LockMap::new(16);
        let a = map.stripe_for(b"key");
        let b = map.stripe_for(b"key");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.num_stripes(), 16);
    }

    #[test]
    fn test_resize_moves_keys() {
        let map = LockMap::new(4);
        for i in 0..32u32 {
            let key = Bytes::from(format!("key{}", i));
            let stripe = map.stripe_for(&key);
            stripe
                .state
                .lock()
                .keys
                .insert(key, LockInfo::new(u64::from(i), 0, true));
        }
        let old = map.table();

        map.resize(7);
        assert_eq!(map.num_stripes(), 7);
        for stripe in old.iter() {
            let state = stripe.state.lock();
            assert!(state.retired);
            assert!(state.keys.is_empty());
        }

        for i in 0..32u32 {
            let key = format!("key{}", i);
            let stripe = map.stripe_for(key.as_bytes());
            let state = stripe.state.lock();
            assert!(!state.retired);
            assert!(state.keys[key.as_bytes()].holds(u64::from(i)));
        }
    }
}
