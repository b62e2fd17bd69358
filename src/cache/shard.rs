//! The contract every cache shard implements.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::InsertError;

/// Callback run exactly once when the cache frees an entry.
///
/// Deleters always run after the shard lock has been released, so they may
/// call back into the cache.
pub type Deleter<V> = Box<dyn FnOnce(&[u8], &V) + Send>;

/// Eviction priority of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Kept in the high-priority pool, evicted after low-priority entries.
    High,
    /// Evicted first.
    #[default]
    Low,
}

/// A pinned entry as handed out by a shard.
///
/// `slot` and `id` name the entry inside its shard; `id` is never reused,
/// so a stale pair is detected even after the slot was recycled.
pub struct PinnedEntry<V> {
    pub slot: usize,
    pub id: u64,
    pub key: Bytes,
    pub hash: u32,
    pub charge: usize,
    pub value: Arc<V>,
}

/// A single fixed-capacity partition of a sharded cache.
///
/// A shard guards its own state; every method takes `&self`.
pub trait CacheShard<V>: Send + Sync {
    /// Insert an entry. With `pin` the entry is returned pinned with one
    /// reference, otherwise it is placed on the eviction list.
    fn insert(
        &self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
        priority: Priority,
        pin: bool,
    ) -> Result<Option<PinnedEntry<V>>, InsertError<V>>;

    /// Find and pin an entry.
    fn lookup(&self, key: &[u8], hash: u32) -> Option<PinnedEntry<V>>;

    /// Add a reference to a pinned entry. Fails if it no longer exists.
    fn ref_entry(&self, slot: usize, id: u64) -> bool;

    /// Drop one reference. Returns true if the entry was freed.
    fn release(&self, slot: usize, id: u64, force_erase: bool) -> bool;

    /// Remove the entry from the table; freeing waits for the last release.
    fn erase(&self, key: &[u8], hash: u32);

    fn set_capacity(&self, capacity: usize);

    fn set_strict_capacity_limit(&self, strict_capacity_limit: bool);

    fn set_high_priority_pool_ratio(&self, ratio: f64);

    fn capacity(&self) -> usize;

    /// Total charge of all entries, pinned or not.
    fn usage(&self) -> usize;

    /// Total charge of entries with outstanding references.
    fn pinned_usage(&self) -> usize;

    /// Number of entries reachable through lookup.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every cached entry as `(key, value, charge)`.
    ///
    /// With `thread_safe` the shard lock is held for the whole traversal and
    /// the callback must not call into the cache. Otherwise the entries are
    /// snapshotted first and visited without the lock.
    fn apply_to_all_entries(&self, callback: &mut dyn FnMut(&[u8], &V, usize), thread_safe: bool);

    /// Free every entry without outstanding references. Returns the count.
    fn erase_unref_entries(&self) -> usize;

    fn printable_options(&self) -> String {
        String::new()
    }

    /// Implementation name reported by the cache.
    fn name(&self) -> &'static str {
        "ShardedCache"
    }
}
