//! Sharded cache.
//!
//! `2^num_shard_bits` shards are created with the capacity split evenly
//! between them. Keys are routed by the top `num_shard_bits` bits of their
//! hash, so the same `(key, hash)` always lands in the same shard.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::InsertError;
use crate::options::{LruCacheOptions, MAX_NUM_SHARD_BITS};
use crate::{Error, Result};

use super::lru::LruCacheShard;
use super::shard::{CacheShard, Deleter, PinnedEntry, Priority};

/// Every shard gets at least this much capacity when shard bits are derived.
const MIN_SHARD_SIZE: usize = 512 * 1024;

/// Upper bound on derived shard bits.
const MAX_DEFAULT_SHARD_BITS: i32 = 6;

/// Number of shard bits to use for a cache of `capacity` bytes.
pub fn default_cache_shard_bits(capacity: usize) -> i32 {
    let mut num_shard_bits = 0;
    let mut num_shards = capacity / MIN_SHARD_SIZE;
    loop {
        num_shards >>= 1;
        if num_shards == 0 {
            return num_shard_bits;
        }
        num_shard_bits += 1;
        if num_shard_bits >= MAX_DEFAULT_SHARD_BITS {
            return num_shard_bits;
        }
    }
}

/// Statistics for cache operations.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: AtomicU64,
    /// Number of cache misses.
    pub misses: AtomicU64,
    /// Number of successful insertions.
    pub inserts: AtomicU64,
    /// Number of insertions rejected by the strict capacity limit.
    pub insert_failures: AtomicU64,
}

impl CacheStats {
    /// Create new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.insert_failures.store(0, Ordering::Relaxed);
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicU64::new(self.hits.load(Ordering::Relaxed)),
            misses: AtomicU64::new(self.misses.load(Ordering::Relaxed)),
            inserts: AtomicU64::new(self.inserts.load(Ordering::Relaxed)),
            insert_failures: AtomicU64::new(self.insert_failures.load(Ordering::Relaxed)),
        }
    }
}

/// A pinned reference to one cache entry.
///
/// The entry cannot be evicted while any handle to it exists. Dropping the
/// handle releases the pin; [`Handle::release`] does the same and reports
/// whether the entry was freed. Because both consume the handle, an entry
/// cannot be released twice through the same handle.
pub struct Handle<V> {
    shard: Arc<dyn CacheShard<V>>,
    entry: PinnedEntry<V>,
    released: bool,
}

impl<V> Handle<V> {
    fn new(shard: Arc<dyn CacheShard<V>>, entry: PinnedEntry<V>) -> Self {
        Self {
            shard,
            entry,
            released: false,
        }
    }

    pub fn value(&self) -> &V {
        &self.entry.value
    }

    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }

    pub fn hash(&self) -> u32 {
        self.entry.hash
    }

    pub fn charge(&self) -> usize {
        self.entry.charge
    }

    /// Release the pin. With `force_erase` the entry is also removed from
    /// the cache if this was the last reference.
    ///
    /// Returns true if the entry was freed.
    pub fn release(mut self, force_erase: bool) -> bool {
        self.released = true;
        self.shard
            .release(self.entry.slot, self.entry.id, force_erase)
    }
}

impl<V> Deref for Handle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<V> Drop for Handle<V> {
    fn drop(&mut self) {
        if !self.released {
            self.shard.release(self.entry.slot, self.entry.id, false);
        }
    }
}

impl<V> fmt::Debug for Handle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.entry.key)
            .field("hash", &self.entry.hash)
            .field("charge", &self.entry.charge)
            .finish_non_exhaustive()
    }
}

/// Priority levels a memory balancer assigns cache bytes to, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CachePriority {
    Pri0,
    Pri1,
    Pri2,
    Pri3,
    Pri4,
    Pri5,
    Pri6,
    Pri7,
    Pri8,
    Pri9,
    Pri10,
    Pri11,
}

impl CachePriority {
    /// Number of priority levels.
    pub const COUNT: usize = 12;

    /// Lowest priority.
    pub const LAST: CachePriority = CachePriority::Pri11;

    pub fn index(self) -> usize {
        self as usize
    }
}

struct CapacityState {
    capacity: usize,
    strict_capacity_limit: bool,
    /// Share of the balancer's memory target assigned to this cache.
    cache_ratio: f64,
}

/// A cache split into independently locked shards.
pub struct ShardedCache<V> {
    shards: Vec<Arc<dyn CacheShard<V>>>,
    num_shard_bits: u32,
    /// Guards the cache-wide settings pushed down to every shard.
    capacity: Mutex<CapacityState>,
    last_id: AtomicU64,
    stats: Arc<CacheStats>,
    /// Bytes assigned per [`CachePriority`].
    cache_bytes: [AtomicI64; CachePriority::COUNT],
}

/// A sharded cache of [`LruCacheShard`]s.
pub type LruCache<V> = ShardedCache<V>;

/// Build a sharded LRU cache.
pub fn new_lru_cache<V: Send + Sync + 'static>(options: &LruCacheOptions) -> Result<LruCache<V>> {
    options.validate()?;
    let ratio = options.high_pri_pool_ratio;
    let strict = options.strict_capacity_limit;
    ShardedCache::with_shard_factory(
        options.capacity,
        options.num_shard_bits,
        strict,
        |per_shard| -> Arc<dyn CacheShard<V>> {
            Arc::new(LruCacheShard::new(per_shard, strict, ratio))
        },
    )
}

impl<V: Send + Sync + 'static> ShardedCache<V> {
    /// Create a cache whose shards are built by `factory`, which receives
    /// the capacity of each shard.
    ///
    /// A negative `num_shard_bits` derives the shard count from `capacity`.
    /// Fails with `InvalidConfiguration` for `MAX_NUM_SHARD_BITS` or more.
    pub fn with_shard_factory<F>(
        capacity: usize,
        num_shard_bits: i32,
        strict_capacity_limit: bool,
        mut factory: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Arc<dyn CacheShard<V>>,
    {
        if num_shard_bits >= MAX_NUM_SHARD_BITS {
            return Err(Error::invalid_configuration(format!(
                "num_shard_bits must be less than {}",
                MAX_NUM_SHARD_BITS
            )));
        }
        let bits = if num_shard_bits < 0 {
            default_cache_shard_bits(capacity)
        } else {
            num_shard_bits
        } as u32;
        let num_shards = 1usize << bits;
        let per_shard = per_shard_capacity(capacity, num_shards);
        let shards = (0..num_shards).map(|_| factory(per_shard)).collect();

        tracing::debug!(capacity, num_shards, strict_capacity_limit, "created sharded cache");

        Ok(Self {
            shards,
            num_shard_bits: bits,
            capacity: Mutex::new(CapacityState {
                capacity,
                strict_capacity_limit,
                cache_ratio: 0.0,
            }),
            last_id: AtomicU64::new(1),
            stats: Arc::new(CacheStats::new()),
            cache_bytes: Default::default(),
        })
    }

    /// Index of the shard owning `hash`.
    pub fn shard_index(&self, hash: u32) -> usize {
        if self.num_shard_bits > 0 {
            (hash >> (32 - self.num_shard_bits)) as usize
        } else {
            0
        }
    }

    fn shard(&self, hash: u32) -> &Arc<dyn CacheShard<V>> {
        &self.shards[self.shard_index(hash)]
    }

    /// Insert an entry without pinning it.
    ///
    /// Fails only under a strict capacity limit, handing the value back.
    pub fn insert(
        &self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
        priority: Priority,
    ) -> std::result::Result<(), InsertError<V>> {
        self.insert_impl(key, hash, value, charge, deleter, priority, false)
            .map(|_| ())
    }

    /// Insert an entry and return it pinned.
    ///
    /// Without a strict capacity limit the insert always succeeds, even if
    /// it takes the shard over capacity.
    pub fn insert_with_handle(
        &self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
        priority: Priority,
    ) -> std::result::Result<Handle<V>, InsertError<V>> {
        let shard = Arc::clone(self.shard(hash));
        match self.insert_impl(key, hash, value, charge, deleter, priority, true)? {
            Some(entry) => Ok(Handle::new(shard, entry)),
            None => unreachable!("pinned insert returned no entry"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_impl(
        &self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
        priority: Priority,
        pin: bool,
    ) -> std::result::Result<Option<PinnedEntry<V>>, InsertError<V>> {
        let result = self
            .shard(hash)
            .insert(key, hash, value, charge, deleter, priority, pin);
        match result {
            Ok(_) => self.stats.inserts.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.insert_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Find and pin an entry.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<Handle<V>> {
        let shard = self.shard(hash);
        match shard.lookup(key, hash) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(Handle::new(Arc::clone(shard), entry))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take an additional pin on an entry.
    ///
    /// Returns None if the entry has already been freed.
    pub fn ref_handle(&self, handle: &Handle<V>) -> Option<Handle<V>> {
        let shard = Arc::clone(&handle.shard);
        if shard.ref_entry(handle.entry.slot, handle.entry.id) {
            let entry = PinnedEntry {
                slot: handle.entry.slot,
                id: handle.entry.id,
                key: handle.entry.key.clone(),
                hash: handle.entry.hash,
                charge: handle.entry.charge,
                value: Arc::clone(&handle.entry.value),
            };
            Some(Handle::new(shard, entry))
        } else {
            None
        }
    }

    /// Release a pin; see [`Handle::release`].
    pub fn release(&self, handle: Handle<V>, force_erase: bool) -> bool {
        handle.release(force_erase)
    }

    /// Remove an entry so no new lookup finds it. Outstanding handles stay
    /// valid and the entry is freed when the last one is released.
    pub fn erase(&self, key: &[u8], hash: u32) {
        self.shard(hash).erase(key, hash);
    }

    /// Generate a new id, unique for the lifetime of this cache.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Change the total capacity. Shrinking evicts unpinned entries.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.capacity.lock();
        let per_shard = per_shard_capacity(capacity, self.shards.len());
        for shard in &self.shards {
            shard.set_capacity(per_shard);
        }
        state.capacity = capacity;
        tracing::debug!(capacity, per_shard, "cache capacity changed");
    }

    pub fn capacity(&self) -> usize {
        self.capacity.lock().capacity
    }

    pub fn set_strict_capacity_limit(&self, strict_capacity_limit: bool) {
        let mut state = self.capacity.lock();
        for shard in &self.shards {
            shard.set_strict_capacity_limit(strict_capacity_limit);
        }
        state.strict_capacity_limit = strict_capacity_limit;
        tracing::debug!(strict_capacity_limit, "cache strict capacity limit changed");
    }

    pub fn has_strict_capacity_limit(&self) -> bool {
        self.capacity.lock().strict_capacity_limit
    }

    /// Change the high-priority pool ratio of every shard.
    pub fn set_high_priority_pool_ratio(&self, ratio: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(crate::Error::invalid_configuration(
                "high_pri_pool_ratio must be between 0.0 and 1.0",
            ));
        }
        let _state = self.capacity.lock();
        for shard in &self.shards {
            shard.set_high_priority_pool_ratio(ratio);
        }
        Ok(())
    }

    /// Total charge of all entries.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.usage()).sum()
    }

    /// Charge of the entry behind `handle`.
    pub fn handle_usage(&self, handle: &Handle<V>) -> usize {
        handle.charge()
    }

    /// Total charge of pinned entries.
    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|s| s.pinned_usage()).sum()
    }

    /// Number of cached entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every cached entry, shard by shard.
    ///
    /// With `thread_safe` each shard stays locked while it is visited, so
    /// `callback` must not call back into this cache.
    pub fn apply_to_all_cache_entries<F>(&self, mut callback: F, thread_safe: bool)
    where
        F: FnMut(&[u8], &V, usize),
    {
        for shard in &self.shards {
            shard.apply_to_all_entries(&mut callback, thread_safe);
        }
    }

    /// Free every entry that is not pinned.
    pub fn erase_unref_entries(&self) -> usize {
        self.shards.iter().map(|s| s.erase_unref_entries()).sum()
    }

    pub fn num_shard_bits(&self) -> u32 {
        self.num_shard_bits
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Human readable summary of the cache configuration.
    pub fn printable_options(&self) -> String {
        let state = self.capacity.lock();
        let mut out = format!(
            "    num_shard_bits : {}\n    capacity : {}\n    strict_capacity_limit : {}\n",
            self.num_shard_bits, state.capacity, state.strict_capacity_limit as i32
        );
        if let Some(shard) = self.shards.first() {
            out.push_str(&shard.printable_options());
        }
        out
    }

    /// Bytes assigned to `pri`.
    pub fn cache_bytes(&self, pri: CachePriority) -> i64 {
        self.cache_bytes[pri.index()].load(Ordering::Relaxed)
    }

    /// Bytes assigned across all priorities.
    pub fn total_cache_bytes(&self) -> i64 {
        self.cache_bytes.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    pub fn set_cache_bytes(&self, pri: CachePriority, bytes: i64) {
        self.cache_bytes[pri.index()].store(bytes, Ordering::Relaxed);
    }

    pub fn add_cache_bytes(&self, pri: CachePriority, bytes: i64) {
        self.cache_bytes[pri.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn cache_ratio(&self) -> f64 {
        self.capacity.lock().cache_ratio
    }

    pub fn set_cache_ratio(&self, ratio: f64) {
        self.capacity.lock().cache_ratio = ratio;
    }

    /// Name of the shard implementation, e.g. `"LRUCache"`.
    pub fn cache_name(&self) -> &'static str {
        self.shards.first().map_or("ShardedCache", |s| s.name())
    }

    /// Drop the cache without freeing its entries.
    ///
    /// Deleters never run and the memory is leaked. Meant for process
    /// shutdown, where freeing a large cache only costs time. Outstanding
    /// handles stay valid.
    pub fn disown_data(self) {
        for shard in self.shards {
            std::mem::forget(shard);
        }
        tracing::debug!("cache data disowned");
    }
}

fn per_shard_capacity(capacity: usize, num_shards: usize) -> usize {
    capacity.div_ceil(num_shards)
}
