//! # kvcore
//!
//! Concurrency core of an embedded key-value store: a sharded block cache
//! and a pessimistic point-lock manager.
//!
//! ## Features
//!
//! - **Sharded LRU Cache**: capacity-bounded, per-shard locking, pinned
//!   handles, an optional high-priority pool
//! - **Block Cache**: table data blocks keyed by file and offset
//! - **Point Locks**: shared/exclusive locks striped per column family
//! - **Deadlock Detection**: bounded wait-for graph search with a history of
//!   recent deadlocks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kvcore::{new_lru_cache, LruCacheOptions, Priority, TransactionDbOptions, TransactionManager};
//!
//! // Cache
//! let cache = new_lru_cache::<Vec<u8>>(&LruCacheOptions::new(64 << 20))?;
//! cache.insert(key, hash, value, charge, None, Priority::Low)?;
//! if let Some(handle) = cache.lookup(&key, hash) {
//!     use_value(&*handle);
//! }
//!
//! // Locks
//! let mgr = TransactionManager::new(TransactionDbOptions::default())?;
//! mgr.lock_manager().add_column_family(0);
//! let txn = mgr.begin()?;
//! mgr.lock(&txn, 0, b"key", true)?;
//! mgr.transaction_ended(&txn);
//! ```

// Public modules
pub mod error;
pub mod options;

// Internal modules
mod cache;
mod transaction;
mod util;

// Re-export main types for convenience
pub use error::{Error, InsertError, Result, SubCode};
pub use options::{
    LruCacheOptions, LruCacheOptionsBuilder, TransactionDbOptions, TransactionDbOptionsBuilder,
    TransactionOptions,
};

// Cache
pub use cache::{
    default_cache_shard_bits, new_lru_cache, BlockCache, CachePriority, CacheShard, CacheStats, CachedBlock, Deleter, Handle,
    LruCache, LruCacheShard, PinnedEntry, Priority, ShardedCache,
};

// Transactions
pub use transaction::{
    DeadlockInfo, DeadlockInfoBuffer, DeadlockPath, ExpirationOracle, KeyLockInfo, LockTracker, NoExpiration,
    PessimisticTransaction, PointLockManager, TransactionId, TransactionManager, WaitingInfo,
};

// Hashing used for cache and lock keys
pub use util::hash::{hash, slice_hash};
