//! PessimisticTransaction - the lock-holding side of a transaction.
//!
//! A transaction carries the options the lock manager honours (timeout,
//! deadlock detection, expiration), the locks it has acquired, and what it
//! is currently blocked on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::options::{TransactionDbOptions, TransactionOptions};

use super::lock_map::LockMapStripe;
use super::tracker::LockTracker;
use super::{now_micros, TransactionId};

/// What a blocked transaction is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingInfo {
    /// Transactions holding the lock.
    pub txn_ids: Vec<TransactionId>,
    pub column_family_id: u32,
    pub key: Bytes,
}

/// A transaction taking pessimistic point locks.
pub struct PessimisticTransaction {
    id: TransactionId,
    /// Lock wait timeout in microseconds, already resolved against the
    /// database default.
    lock_timeout: i64,
    deadlock_detect: bool,
    deadlock_detect_depth: usize,
    /// Microsecond deadline after which the locks may be stolen, 0 for never.
    expiration_time: u64,
    tracker: Mutex<LockTracker>,
    waiting: Mutex<Option<WaitingInfo>>,
    /// Stripe this transaction is blocked on, for `cancel_wait`.
    waiting_stripe: Mutex<Option<Arc<LockMapStripe>>>,
    cancelled: AtomicBool,
    locks_stolen: AtomicBool,
}

impl PessimisticTransaction {
    /// Create a new transaction.
    pub fn new(id: TransactionId, options: &TransactionOptions, db_options: &TransactionDbOptions) -> Self {
        let lock_timeout = if options.lock_timeout < 0 {
            db_options.transaction_lock_timeout
        } else {
            options.lock_timeout
        };
        let expiration_time = if options.expiration >= 0 {
            now_micros().saturating_add(options.expiration as u64).max(1)
        } else {
            0
        };
        Self {
            id,
            lock_timeout,
            deadlock_detect: options.deadlock_detect,
            deadlock_detect_depth: options.deadlock_detect_depth.max(1) as usize,
            expiration_time,
            tracker: Mutex::new(LockTracker::new()),
            waiting: Mutex::new(None),
            waiting_stripe: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            locks_stolen: AtomicBool::new(false),
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Lock wait timeout in microseconds. Negative waits forever.
    pub fn lock_timeout(&self) -> i64 {
        self.lock_timeout
    }

    pub fn is_deadlock_detect(&self) -> bool {
        self.deadlock_detect
    }

    pub fn deadlock_detect_depth(&self) -> usize {
        self.deadlock_detect_depth
    }

    /// Microsecond expiration deadline, 0 if the transaction never expires.
    pub fn expiration_time(&self) -> u64 {
        self.expiration_time
    }

    /// Check if the expiration deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.expiration_time > 0 && self.expiration_time <= now_micros()
    }

    /// Transactions this one is currently blocked on. Empty when not waiting.
    pub fn waiting_txns(&self) -> Vec<TransactionId> {
        self.waiting
            .lock()
            .as_ref()
            .map(|w| w.txn_ids.clone())
            .unwrap_or_default()
    }

    /// Full detail of the current wait, if any.
    pub fn waiting_info(&self) -> Option<WaitingInfo> {
        self.waiting.lock().clone()
    }

    pub(crate) fn set_waiting_txn(&self, txn_ids: &[TransactionId], column_family_id: u32, key: &Bytes) {
        *self.waiting.lock() = Some(WaitingInfo {
            txn_ids: txn_ids.to_vec(),
            column_family_id,
            key: key.clone(),
        });
    }

    pub(crate) fn clear_waiting_txn(&self) {
        *self.waiting.lock() = None;
    }

    pub(crate) fn set_waiting_stripe(&self, stripe: Option<Arc<LockMapStripe>>) {
        *self.waiting_stripe.lock() = stripe;
    }

    pub(crate) fn waiting_stripe(&self) -> Option<Arc<LockMapStripe>> {
        self.waiting_stripe.lock().clone()
    }

    /// Make every current and future lock wait of this transaction return
    /// `Aborted`. Use `PointLockManager::cancel_wait` to also wake it.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Give this transaction's locks to whoever asks for them.
    ///
    /// Returns false if the transaction has not expired yet.
    pub(crate) fn try_steal_locks(&self) -> bool {
        if !self.is_expired() {
            return false;
        }
        self.locks_stolen.store(true, Ordering::SeqCst);
        true
    }

    /// Check if another transaction took over this one's expired locks.
    pub fn locks_stolen(&self) -> bool {
        self.locks_stolen.load(Ordering::SeqCst)
    }

    /// Record an acquired lock.
    pub fn track_lock(&self, column_family_id: u32, key: Bytes, exclusive: bool) {
        self.tracker.lock().track(column_family_id, key, exclusive);
    }

    /// Check if a lock at least as strong as requested is already held.
    pub fn holds_lock(&self, column_family_id: u32, key: &[u8], exclusive: bool) -> bool {
        self.tracker.lock().covers(column_family_id, key, exclusive)
    }

    pub(crate) fn untrack_lock(&self, column_family_id: u32, key: &[u8]) -> bool {
        self.tracker.lock().untrack(column_family_id, key)
    }

    /// Take the tracked locks, leaving the tracker empty.
    pub(crate) fn take_tracked_locks(&self) -> LockTracker {
        std::mem::take(&mut *self.tracker.lock())
    }

    /// Copy of the tracked locks.
    pub fn tracked_locks(&self) -> LockTracker {
        self.tracker.lock().clone()
    }

    /// Number of tracked locks.
    pub fn num_locks(&self) -> usize {
        self.tracker.lock().len()
    }
}

impl std::fmt::Debug for PessimisticTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PessimisticTransaction")
            .field("id", &self.id)
            .field("lock_timeout", &self.lock_timeout)
            .field("deadlock_detect", &self.deadlock_detect)
            .field("expiration_time", &self.expiration_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_falls_back_to_db_default() {
        let db_opts = TransactionDbOptions {
            transaction_lock_timeout: 250,
            ..Default::default()
        };
        let txn = PessimisticTransaction::new(1, &TransactionOptions::default(), &db_opts);
        assert_eq!(txn.lock_timeout(), 250);

        let opts = TransactionOptions {
            lock_timeout: 0,
            ..Default::default()
        };
        let txn = PessimisticTransaction::new(2, &opts, &db_opts);
        assert_eq!(txn.lock_timeout(), 0);
    }

    #[test]
    fn test_expiration() {
        let db_opts = TransactionDbOptions::default();
        let txn = PessimisticTransaction::new(1, &TransactionOptions::default(), &db_opts);
        assert_eq!(txn.expiration_time(), 0);
        assert!(!txn.is_expired());
        assert!(!txn.try_steal_locks());

        let opts = TransactionOptions {
            expiration: 0,
            ..Default::default()
        };
        let txn = PessimisticTransaction::new(2, &opts, &db_opts);
        assert!(txn.is_expired());
        assert!(txn.try_steal_locks());
        assert!(txn.locks_stolen());
    }

    #[test]
    fn test_waiting_info() {
        let txn = PessimisticTransaction::new(1, &TransactionOptions::default(), &TransactionDbOptions::default());
        assert!(txn.waiting_txns().is_empty());

        txn.set_waiting_txn(&[7, 8], 3, &Bytes::from("k"));
        assert_eq!(txn.waiting_txns(), vec![7, 8]);
        assert_eq!(txn.waiting_info().unwrap().column_family_id, 3);

        txn.clear_waiting_txn();
        assert!(txn.waiting_info().is_none());
    }

    #[test]
    fn test_tracked_locks() {
        let txn = PessimisticTransaction::new(1, &TransactionOptions::default(), &TransactionDbOptions::default());
        txn.track_lock(1, Bytes::from("a"), true);
        assert!(txn.holds_lock(1, b"a", false));
        assert_eq!(txn.num_locks(), 1);

        let taken = txn.take_tracked_locks();
        assert_eq!(taken.len(), 1);
        assert_eq!(txn.num_locks(), 0);
    }
}
