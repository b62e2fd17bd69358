//! Transaction module - pessimistic point locking.
//!
//! This module provides:
//! - A striped per-column-family lock table with shared and exclusive locks
//! - Deadlock detection over a wait-for graph, bounded by a search depth
//! - Lock expiration, letting others take over an expired transaction's locks
//!
//! # Lock Lifecycle
//!
//! 1. Begin a transaction through the [`TransactionManager`]
//! 2. Lock keys; conflicting requests block up to the lock timeout
//! 3. Release every tracked lock when the transaction ends
//!
//! # Deadlock Detection
//!
//! Before a transaction with `deadlock_detect` blocks, its wait edges are
//! added to the wait-for graph and searched for a cycle back to it. A cycle,
//! or a search deeper than `deadlock_detect_depth`, fails the request with
//! `Busy(Deadlock)` and is recorded in the deadlock info buffer.

mod deadlock;
mod lock_manager;
mod lock_map;
mod manager;
mod tracker;
mod transaction;

pub use deadlock::{DeadlockInfo, DeadlockInfoBuffer, DeadlockPath};
pub use lock_manager::{ExpirationOracle, KeyLockInfo, NoExpiration, PointLockManager};
pub use manager::TransactionManager;
pub use tracker::LockTracker;
pub use transaction::{PessimisticTransaction, WaitingInfo};

use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction ID type.
pub type TransactionId = u64;

/// Wall clock in microseconds since the Unix epoch.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
