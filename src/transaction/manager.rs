//! TransactionManager - manages active transactions.
//!
//! The transaction manager:
//! - Assigns transaction IDs
//! - Tracks active transactions
//! - Decides whether an expired transaction's locks may be stolen
//! - Takes and releases locks on behalf of transactions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::options::{TransactionDbOptions, TransactionOptions};
use crate::{Error, Result};

use super::lock_manager::{ExpirationOracle, PointLockManager};
use super::transaction::PessimisticTransaction;
use super::TransactionId;

/// Live transactions, held weakly.
#[derive(Default)]
struct Registry {
    txns: RwLock<HashMap<TransactionId, Weak<PessimisticTransaction>>>,
}

impl ExpirationOracle for Registry {
    fn try_steal_expired_locks(&self, txn_id: TransactionId) -> bool {
        match self.txns.read().get(&txn_id).and_then(Weak::upgrade) {
            Some(txn) => txn.try_steal_locks(),
            // Nobody left to own the lock.
            None => true,
        }
    }
}

/// Manages transactions and their locks.
pub struct TransactionManager {
    /// Next transaction ID.
    next_txn_id: AtomicU64,
    options: TransactionDbOptions,
    registry: Arc<Registry>,
    lock_manager: PointLockManager,
}

impl TransactionManager {
    /// Create a new transaction manager.
    pub fn new(options: TransactionDbOptions) -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let lock_manager = PointLockManager::new(&options, Arc::clone(&registry) as Arc<dyn ExpirationOracle>)?;
        Ok(Self {
            next_txn_id: AtomicU64::new(1),
            options,
            registry,
            lock_manager,
        })
    }

    /// The lock manager shared by all transactions of this manager.
    pub fn lock_manager(&self) -> &PointLockManager {
        &self.lock_manager
    }

    pub fn options(&self) -> &TransactionDbOptions {
        &self.options
    }

    /// Begin a new transaction with default options.
    pub fn begin(&self) -> Result<Arc<PessimisticTransaction>> {
        self.begin_with_options(&TransactionOptions::default())
    }

    /// Begin a transaction with specific options.
    pub fn begin_with_options(&self, options: &TransactionOptions) -> Result<Arc<PessimisticTransaction>> {
        options.validate()?;
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(PessimisticTransaction::new(txn_id, options, &self.options));

        let mut txns = self.registry.txns.write();
        txns.retain(|_, weak| weak.strong_count() > 0);
        txns.insert(txn_id, Arc::downgrade(&txn));
        Ok(txn)
    }

    /// Lock a key for `txn` and track it.
    ///
    /// Fails with `Aborted` once the transaction's expired locks were stolen.
    pub fn lock(&self, txn: &PessimisticTransaction, column_family_id: u32, key: &[u8], exclusive: bool) -> Result<()> {
        if txn.locks_stolen() {
            return Err(Error::Aborted(format!(
                "Transaction {} expired and lost its locks",
                txn.id()
            )));
        }
        if txn.holds_lock(column_family_id, key, exclusive) {
            return Ok(());
        }
        self.lock_manager.try_lock(txn, column_family_id, key, exclusive)?;
        txn.track_lock(column_family_id, bytes::Bytes::copy_from_slice(key), exclusive);
        Ok(())
    }

    /// Release one lock held by `txn`.
    pub fn unlock(&self, txn: &PessimisticTransaction, column_family_id: u32, key: &[u8]) {
        if txn.untrack_lock(column_family_id, key) {
            self.lock_manager.unlock(txn, column_family_id, key);
        }
    }

    /// Release every lock `txn` has tracked.
    pub fn release_locks(&self, txn: &PessimisticTransaction) {
        let tracker = txn.take_tracked_locks();
        if !tracker.is_empty() {
            self.lock_manager.unlock_tracked(txn, &tracker);
        }
    }

    /// Release the transaction's locks and stop tracking it.
    pub fn transaction_ended(&self, txn: &PessimisticTransaction) {
        self.release_locks(txn);
        self.registry.txns.write().remove(&txn.id());
    }

    /// Look up a live transaction.
    pub fn get(&self, txn_id: TransactionId) -> Option<Arc<PessimisticTransaction>> {
        self.registry.txns.read().get(&txn_id).and_then(Weak::upgrade)
    }

    /// Get the number of active transactions.
    pub fn active_count(&self) -> usize {
        self.registry
            .txns
            .read()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl ExpirationOracle for TransactionManager {
    fn try_steal_expired_locks(&self, txn_id: TransactionId) -> bool {
        self.registry.try_steal_expired_locks(txn_id)
    }
}
