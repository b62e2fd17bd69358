//! PointLockManager - pessimistic per-key locks with deadlock detection.
//!
//! Each column family owns a [`LockMap`] split into stripes. Acquiring a
//! lock takes the key's stripe mutex; a conflicting request waits on the
//! stripe condvar until a holder unlocks, the lock expires, or the timeout
//! elapses.
//!
//! Locks are always taken in this order:
//!
//! 1. `lock_maps`, then `default_num_stripes`
//! 2. stripe mutexes, ascending column family id then stripe index
//! 3. `wait_graph`
//! 4. the deadlock buffer
//!
//! Transaction-local mutexes are only ever taken last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::error::SubCode;
use crate::options::TransactionDbOptions;
use crate::{Error, Result};

use super::deadlock::{DeadlockInfoBuffer, DeadlockPath, WaitGraph, WaitRequest};
use super::lock_map::{stripe_index, LockInfo, LockMap, LockMapStripe, StripeState};
use super::tracker::LockTracker;
use super::transaction::PessimisticTransaction;
use super::{now_micros, TransactionId};

/// Decides whether the expired locks of a transaction may be taken over.
pub trait ExpirationOracle: Send + Sync {
    /// Called when `txn_id` holds a lock past its expiration time. Returning
    /// true hands the lock to the requester.
    fn try_steal_expired_locks(&self, txn_id: TransactionId) -> bool;
}

/// Never lets expired locks be stolen.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExpiration;

impl ExpirationOracle for NoExpiration {
    fn try_steal_expired_locks(&self, _txn_id: TransactionId) -> bool {
        false
    }
}

/// One locked key as reported by [`PointLockManager::point_lock_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLockInfo {
    pub column_family_id: u32,
    pub key: Bytes,
    pub ids: Vec<TransactionId>,
    pub exclusive: bool,
}

enum Attempt {
    Done(Result<()>),
    /// The stripe was retired by a resize; reload the table and retry.
    Retired,
}

/// Pessimistic point lock manager.
pub struct PointLockManager {
    /// Stripe count for new column families. Only read or written while
    /// `lock_maps` is held.
    default_num_stripes: Mutex<usize>,
    /// Limit on number of keys locked per column family (`<= 0` unlimited).
    max_num_locks: i64,
    lock_maps: Mutex<HashMap<u32, Arc<LockMap>>>,
    wait_graph: Mutex<WaitGraph>,
    dlock_buffer: DeadlockInfoBuffer,
    oracle: Arc<dyn ExpirationOracle>,
}

impl PointLockManager {
    /// Create a new lock manager.
    pub fn new(options: &TransactionDbOptions, oracle: Arc<dyn ExpirationOracle>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            default_num_stripes: Mutex::new(options.num_stripes),
            max_num_locks: options.max_num_locks,
            lock_maps: Mutex::new(HashMap::new()),
            wait_graph: Mutex::new(WaitGraph::new()),
            dlock_buffer: DeadlockInfoBuffer::new(options.max_num_deadlocks as usize),
            oracle,
        })
    }

    /// Register a column family. Registering it twice is a no-op.
    pub fn add_column_family(&self, column_family_id: u32) {
        let mut lock_maps = self.lock_maps.lock();
        if lock_maps.contains_key(&column_family_id) {
            return;
        }
        // Read under `lock_maps` so a concurrent resize cannot be missed.
        let num_stripes = *self.default_num_stripes.lock();
        lock_maps.insert(column_family_id, Arc::new(LockMap::new(num_stripes)));
        tracing::debug!(column_family_id, num_stripes, "added column family to lock manager");
    }

    /// Drop a column family's lock table. Later requests for it fail with
    /// `InvalidArgument`.
    pub fn remove_column_family(&self, column_family_id: u32) {
        if self.lock_maps.lock().remove(&column_family_id).is_some() {
            tracing::debug!(column_family_id, "removed column family from lock manager");
        }
    }

    fn lock_map(&self, column_family_id: u32) -> Result<Arc<LockMap>> {
        self.lock_maps
            .lock()
            .get(&column_family_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!("Column family id not found: {}", column_family_id))
            })
    }

    /// Lock `key` in `column_family_id` for `txn`.
    ///
    /// Blocks for at most the transaction's lock timeout when another
    /// transaction holds a conflicting lock.
    pub fn try_lock(
        &self,
        txn: &PessimisticTransaction,
        column_family_id: u32,
        key: &[u8],
        exclusive: bool,
    ) -> Result<()> {
        let lock_map = self.lock_map(column_family_id)?;
        let key = Bytes::copy_from_slice(key);
        let lock_info = LockInfo::new(txn.id(), txn.expiration_time(), exclusive);
        self.acquire_with_timeout(txn, &lock_map, column_family_id, &key, lock_info)
    }

    fn acquire_with_timeout(
        &self,
        txn: &PessimisticTransaction,
        lock_map: &LockMap,
        column_family_id: u32,
        key: &Bytes,
        lock_info: LockInfo,
    ) -> Result<()> {
        let timeout = txn.lock_timeout();
        let end_time = (timeout > 0).then(|| now_micros().saturating_add(timeout as u64));

        loop {
            let stripe = lock_map.stripe_for(key);
            let guard = if timeout < 0 {
                stripe.state.lock()
            } else {
                let remaining = match end_time {
                    Some(end) => end.saturating_sub(now_micros()),
                    None => 0,
                };
                stripe
                    .state
                    .try_lock_for(Duration::from_micros(remaining))
                    .ok_or(Error::TimedOut(SubCode::MutexTimeout))?
            };
            if guard.retired {
                continue;
            }

            match self.acquire_on_stripe(txn, lock_map, &stripe, guard, column_family_id, key, &lock_info, end_time) {
                Attempt::Done(result) => return result,
                Attempt::Retired => continue,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn acquire_on_stripe(
        &self,
        txn: &PessimisticTransaction,
        lock_map: &LockMap,
        stripe: &Arc<LockMapStripe>,
        mut guard: MutexGuard<'_, StripeState>,
        column_family_id: u32,
        key: &Bytes,
        lock_info: &LockInfo,
        end_time: Option<u64>,
    ) -> Attempt {
        let mut expire_time_hint = 0;
        let mut wait_ids = Vec::new();
        let mut result = self.acquire_locked(lock_map, &mut guard, key, lock_info, &mut expire_time_hint, &mut wait_ids);
        if result.is_ok() || txn.lock_timeout() == 0 {
            return Attempt::Done(result);
        }

        loop {
            let cv_end_time = match (expire_time_hint > 0, end_time) {
                (true, Some(end)) => Some(expire_time_hint.min(end)),
                (true, None) => Some(expire_time_hint),
                (false, end) => end,
            };

            if !wait_ids.is_empty() {
                if txn.is_deadlock_detect() {
                    let request = WaitRequest {
                        txn_id: txn.id(),
                        wait_ids: &wait_ids,
                        column_family_id,
                        key,
                        exclusive: lock_info.exclusive,
                        depth: txn.deadlock_detect_depth(),
                    };
                    if self.wait_graph.lock().increment_waiters(&request, &self.dlock_buffer) {
                        return Attempt::Done(Err(Error::Busy(SubCode::Deadlock)));
                    }
                }
                txn.set_waiting_txn(&wait_ids, column_family_id, key);
            }

            // Publish the stripe before checking the flag so a concurrent
            // cancel_wait either sees it or is seen here.
            txn.set_waiting_stripe(Some(Arc::clone(stripe)));
            let cancelled = txn.is_cancelled();
            let mut deadline_passed = false;
            if !cancelled {
                tracing::trace!(txn_id = txn.id(), column_family_id, holders = ?wait_ids, "waiting for lock");
                match cv_end_time {
                    None => stripe.cv.wait(&mut guard),
                    Some(cv_end) => {
                        let now = now_micros();
                        if cv_end > now {
                            let _ = stripe.cv.wait_for(&mut guard, Duration::from_micros(cv_end - now));
                        }
                    }
                }
                deadline_passed = end_time.is_some_and(|end| now_micros() >= end);
            }
            txn.set_waiting_stripe(None);

            if !wait_ids.is_empty() {
                txn.clear_waiting_txn();
                if txn.is_deadlock_detect() {
                    self.wait_graph.lock().decrement_waiters(txn.id(), &wait_ids);
                }
            }

            if cancelled || txn.is_cancelled() {
                return Attempt::Done(Err(Error::Aborted("Lock wait cancelled".to_string())));
            }
            if guard.retired {
                return Attempt::Retired;
            }

            // Even past the deadline, try once more: the lock may have
            // expired without anyone signalling us.
            result = self.acquire_locked(lock_map, &mut guard, key, lock_info, &mut expire_time_hint, &mut wait_ids);
            if result.is_ok() || deadline_passed {
                if let Err(err) = &result {
                    tracing::trace!(txn_id = txn.id(), column_family_id, error = %err, "lock wait timed out");
                }
                return Attempt::Done(result);
            }
        }
    }

    /// Try to take the lock with the stripe mutex held.
    ///
    /// On conflict the holders are returned in `txn_ids` and, if their lock
    /// can expire, its deadline in `expire_time`.
    fn acquire_locked(
        &self,
        lock_map: &LockMap,
        stripe: &mut StripeState,
        key: &Bytes,
        txn_lock_info: &LockInfo,
        expire_time: &mut u64,
        txn_ids: &mut Vec<TransactionId>,
    ) -> Result<()> {
        let txn_id = txn_lock_info.txn_ids[0];
        *expire_time = 0;
        txn_ids.clear();

        if let Some(lock_info) = stripe.keys.get_mut(&key[..]) {
            if lock_info.exclusive || txn_lock_info.exclusive {
                if lock_info.txn_ids.len() == 1 && lock_info.txn_ids[0] == txn_id {
                    // Sole holder: take it in the requested mode.
                    lock_info.exclusive = txn_lock_info.exclusive;
                    lock_info.expiration_time = txn_lock_info.expiration_time;
                } else if self.is_lock_expired(txn_id, lock_info, expire_time) {
                    lock_info.txn_ids = txn_lock_info.txn_ids.clone();
                    lock_info.exclusive = txn_lock_info.exclusive;
                    lock_info.expiration_time = txn_lock_info.expiration_time;
                } else {
                    txn_ids.extend(lock_info.txn_ids.iter().copied().filter(|id| *id != txn_id));
                    return Err(Error::TimedOut(SubCode::LockTimeout));
                }
            } else {
                // Shared request on a shared lock.
                if !lock_info.holds(txn_id) {
                    lock_info.txn_ids.push(txn_id);
                }
                // The deadline never moves back when a holder leaves.
                lock_info.expiration_time = lock_info.expiration_time.max(txn_lock_info.expiration_time);
            }
            return Ok(());
        }

        if self.max_num_locks > 0 && lock_map.lock_count() >= self.max_num_locks {
            tracing::trace!(txn_id, max_num_locks = self.max_num_locks, "lock limit reached");
            return Err(Error::Busy(SubCode::LockLimit));
        }
        stripe.keys.insert(key.clone(), txn_lock_info.clone());
        lock_map.lock_cnt.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(())
    }

    /// Check whether every other holder's lock has expired and been given up.
    fn is_lock_expired(&self, txn_id: TransactionId, lock_info: &LockInfo, expire_time: &mut u64) -> bool {
        if lock_info.expiration_time == 0 {
            *expire_time = 0;
            return false;
        }

        if lock_info.expiration_time > now_micros() {
            *expire_time = lock_info.expiration_time;
            return false;
        }

        for id in lock_info.txn_ids.iter().copied().filter(|id| *id != txn_id) {
            if !self.oracle.try_steal_expired_locks(id) {
                *expire_time = 0;
                return false;
            }
        }
        true
    }

    /// Release `txn`'s lock on `key`, waking anyone waiting on its stripe.
    pub fn unlock(&self, txn: &PessimisticTransaction, column_family_id: u32, key: &[u8]) {
        let Ok(lock_map) = self.lock_map(column_family_id) else {
            return;
        };
        loop {
            let stripe = lock_map.stripe_for(key);
            let mut guard = stripe.state.lock();
            if guard.retired {
                continue;
            }
            Self::unlock_key(txn.id(), key, &mut guard, &lock_map);
            drop(guard);
            stripe.cv.notify_all();
            return;
        }
    }

    /// Release every lock in `tracker`. Each stripe is locked once.
    pub fn unlock_tracked(&self, txn: &PessimisticTransaction, tracker: &LockTracker) {
        let mut by_cf: HashMap<u32, Vec<&Bytes>> = HashMap::new();
        for (cf, key, _exclusive) in tracker.iter() {
            by_cf.entry(cf).or_default().push(key);
        }

        for (cf, keys) in by_cf {
            let Ok(lock_map) = self.lock_map(cf) else {
                continue;
            };
            let mut pending = keys;
            while !pending.is_empty() {
                let table = lock_map.table();
                let mut by_stripe: HashMap<usize, Vec<&Bytes>> = HashMap::new();
                for key in pending.drain(..) {
                    by_stripe.entry(stripe_index(key, table.len())).or_default().push(key);
                }

                for (idx, keys) in by_stripe {
                    let stripe = &table[idx];
                    let mut guard = stripe.state.lock();
                    if guard.retired {
                        // Moved by a resize; retry against the new table.
                        pending.extend(keys);
                        continue;
                    }
                    for key in keys {
                        Self::unlock_key(txn.id(), key, &mut guard, &lock_map);
                    }
                    drop(guard);
                    stripe.cv.notify_all();
                }
            }
        }
    }

    fn unlock_key(txn_id: TransactionId, key: &[u8], stripe: &mut StripeState, lock_map: &LockMap) {
        let Some(lock_info) = stripe.keys.get_mut(key) else {
            // Not locked, or the lock expired and was stolen.
            return;
        };
        if !lock_info.remove_holder(txn_id) {
            return;
        }
        if lock_info.txn_ids.is_empty() {
            stripe.keys.remove(key);
            lock_map.lock_cnt.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        }
    }

    /// Every locked key of every column family, sorted by column family id
    /// and key.
    pub fn point_lock_status(&self) -> Vec<KeyLockInfo> {
        let lock_maps = self.lock_maps.lock();
        let mut cf_ids: Vec<u32> = lock_maps.keys().copied().collect();
        cf_ids.sort_unstable();

        let mut status = Vec::new();
        for cf in cf_ids {
            let table = lock_maps[&cf].table();
            let guards: Vec<_> = table.iter().map(|stripe| stripe.state.lock()).collect();
            let mut keys: Vec<KeyLockInfo> = guards
                .iter()
                .flat_map(|guard| guard.keys.iter())
                .map(|(key, info)| KeyLockInfo {
                    column_family_id: cf,
                    key: key.clone(),
                    ids: info.txn_ids.clone(),
                    exclusive: info.exclusive,
                })
                .collect();
            drop(guards);
            keys.sort_by(|a, b| a.key.cmp(&b.key));
            status.extend(keys);
        }
        status
    }

    /// Recently detected deadlocks, newest first.
    pub fn deadlock_info_buffer(&self) -> Vec<DeadlockPath> {
        self.dlock_buffer.prepare_buffer()
    }

    /// Change how many recent deadlocks are retained.
    pub fn resize_deadlock_buffer(&self, target_size: usize) {
        self.dlock_buffer.resize(target_size);
    }

    /// Change the number of stripes of every column family, and of the ones
    /// added later.
    ///
    /// Safe to call while locks are being taken: blocked waiters are woken
    /// and continue on the new stripes with the rest of their timeout.
    pub fn resize(&self, num_stripes: usize) -> Result<()> {
        if num_stripes == 0 {
            return Err(Error::invalid_configuration("num_stripes must be at least 1"));
        }
        let lock_maps = self.lock_maps.lock();
        *self.default_num_stripes.lock() = num_stripes;

        let mut cf_ids: Vec<u32> = lock_maps.keys().copied().collect();
        cf_ids.sort_unstable();
        for cf in cf_ids {
            lock_maps[&cf].resize(num_stripes);
        }
        tracing::debug!(num_stripes, column_families = lock_maps.len(), "resized lock stripes");
        Ok(())
    }

    /// Number of stripes of a column family.
    pub fn num_stripes(&self, column_family_id: u32) -> Result<usize> {
        Ok(self.lock_map(column_family_id)?.num_stripes())
    }

    /// Number of locked keys in a column family.
    pub fn num_locks(&self, column_family_id: u32) -> Result<i64> {
        Ok(self.lock_map(column_family_id)?.lock_count())
    }

    /// Stop `txn` from waiting for a lock.
    ///
    /// A blocked request returns `Aborted` after removing its wait edges, and
    /// so does every later request that would have to wait.
    pub fn cancel_wait(&self, txn: &PessimisticTransaction) {
        txn.cancel();
        if let Some(stripe) = txn.waiting_stripe() {
            // Holding the mutex orders this notify after the waiter's check.
            let guard = stripe.state.lock();
            drop(guard);
            stripe.cv.notify_all();
        }
    }
}
