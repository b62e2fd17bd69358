//! LRU cache shard with an optional high-priority pool.
//!
//! Entries live in a slab and are linked into one recency list, oldest at
//! the head. When the high-priority pool is enabled the list is split at
//! `low_pri`: everything up to and including `low_pri` is the low-priority
//! pool, everything after it is the high-priority pool. Eviction always
//! starts at the head, so low-priority entries go first.
//!
//! An entry is on the list exactly when it is in the table and has no
//! outstanding references.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::InsertError;

use super::shard::{CacheShard, Deleter, PinnedEntry, Priority};

/// A cache entry.
struct LruHandle<V> {
    key: Bytes,
    hash: u32,
    value: Arc<V>,
    deleter: Option<Deleter<V>>,
    charge: usize,
    id: u64,
    refs: u32,
    /// Reachable through the table.
    in_cache: bool,
    is_high_pri: bool,
    in_high_pri_pool: bool,
    has_hit: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> LruHandle<V> {
    fn pinned(&self, slot: usize) -> PinnedEntry<V> {
        PinnedEntry {
            slot,
            id: self.id,
            key: self.key.clone(),
            hash: self.hash,
            charge: self.charge,
            value: Arc::clone(&self.value),
        }
    }

    fn free(self) {
        if let Some(deleter) = self.deleter {
            deleter(&self.key, &self.value);
        }
    }
}

struct LruShardState<V> {
    capacity: usize,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
    high_pri_pool_capacity: f64,
    /// Charge of every entry owned by the shard.
    usage: usize,
    /// Charge of entries on the recency list.
    lru_usage: usize,
    high_pri_pool_usage: usize,
    table: HashMap<Bytes, usize>,
    nodes: Vec<Option<LruHandle<V>>>,
    free_list: Vec<usize>,
    /// Oldest entry.
    head: Option<usize>,
    /// Newest entry.
    tail: Option<usize>,
    /// Newest low-priority entry.
    low_pri: Option<usize>,
    next_id: u64,
}

impl<V> LruShardState<V> {
    fn node(&self, idx: usize) -> &LruHandle<V> {
        match self.nodes[idx] {
            Some(ref node) => node,
            None => unreachable!("LRU slot {} is vacant", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut LruHandle<V> {
        match self.nodes[idx] {
            Some(ref mut node) => node,
            None => unreachable!("LRU slot {} is vacant", idx),
        }
    }

    /// Look up a live entry by the identity a handle carries.
    fn live_slot(&self, slot: usize, id: u64) -> bool {
        matches!(self.nodes.get(slot), Some(Some(node)) if node.id == id)
    }

    fn find(&self, key: &[u8], hash: u32) -> Option<usize> {
        self.table
            .get(key)
            .copied()
            .filter(|&idx| self.node(idx).hash == hash)
    }

    fn allocate(&mut self, node: LruHandle<V>) -> usize {
        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn take_slot(&mut self, idx: usize) -> LruHandle<V> {
        match self.nodes[idx].take() {
            Some(node) => {
                self.free_list.push(idx);
                node
            }
            None => unreachable!("LRU slot {} is vacant", idx),
        }
    }

    /// Link `idx` right after `after`, or at the head when `after` is None.
    fn link_after(&mut self, idx: usize, after: Option<usize>) {
        let next = match after {
            Some(a) => self.node(a).next,
            None => self.head,
        };

        {
            let node = self.node_mut(idx);
            node.prev = after;
            node.next = next;
        }

        match after {
            Some(a) => self.node_mut(a).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    fn lru_remove(&mut self, idx: usize) {
        let (prev, next, charge, in_high_pri_pool) = {
            let node = self.node(idx);
            (node.prev, node.next, node.charge, node.in_high_pri_pool)
        };

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        if self.low_pri == Some(idx) {
            self.low_pri = prev;
        }

        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;

        self.lru_usage -= charge;
        if in_high_pri_pool {
            self.high_pri_pool_usage -= charge;
        }
    }

    fn lru_insert(&mut self, idx: usize) {
        let (charge, high) = {
            let node = self.node(idx);
            (node.charge, node.is_high_pri || node.has_hit)
        };

        if self.high_pri_pool_ratio > 0.0 && high {
            let tail = self.tail;
            self.link_after(idx, tail);
            self.node_mut(idx).in_high_pri_pool = true;
            self.high_pri_pool_usage += charge;
            self.maintain_pool_size();
        } else {
            let low_pri = self.low_pri;
            self.link_after(idx, low_pri);
            self.node_mut(idx).in_high_pri_pool = false;
            self.low_pri = Some(idx);
        }
        self.lru_usage += charge;
    }

    /// Demote the oldest high-priority entries until the pool fits.
    fn maintain_pool_size(&mut self) {
        while self.high_pri_pool_usage as f64 > self.high_pri_pool_capacity {
            let next = match self.low_pri {
                Some(l) => self.node(l).next,
                None => self.head,
            };
            let Some(idx) = next else { break };

            self.low_pri = Some(idx);
            let node = self.node_mut(idx);
            node.in_high_pri_pool = false;
            let charge = node.charge;
            self.high_pri_pool_usage -= charge;
        }
    }

    /// Free unpinned entries from the head until `charge` more bytes fit.
    fn evict_from_lru(&mut self, charge: usize, deleted: &mut Vec<LruHandle<V>>) {
        while self.usage + charge > self.capacity {
            let Some(idx) = self.head else { break };
            self.lru_remove(idx);
            let node = self.take_slot(idx);
            self.table.remove(&node.key);
            self.usage -= node.charge;
            deleted.push(node);
        }
    }

    fn set_pool_capacity(&mut self) {
        self.high_pri_pool_capacity = self.capacity as f64 * self.high_pri_pool_ratio;
    }
}

/// A single LRU shard.
///
/// With `high_pri_pool_ratio == 0.0` this is a plain LRU; otherwise
/// high-priority entries and entries that were hit at least once are kept
/// in a reserved fraction of the capacity.
pub struct LruCacheShard<V> {
    state: Mutex<LruShardState<V>>,
}

impl<V> LruCacheShard<V> {
    pub fn new(capacity: usize, strict_capacity_limit: bool, high_pri_pool_ratio: f64) -> Self {
        let mut state = LruShardState {
            capacity,
            strict_capacity_limit,
            high_pri_pool_ratio,
            high_pri_pool_capacity: 0.0,
            usage: 0,
            lru_usage: 0,
            high_pri_pool_usage: 0,
            table: HashMap::new(),
            nodes: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
            low_pri: None,
            next_id: 1,
        };
        state.set_pool_capacity();

        Self {
            state: Mutex::new(state),
        }
    }

    /// Charge currently held in the high-priority pool.
    pub fn high_pri_pool_usage(&self) -> usize {
        self.state.lock().high_pri_pool_usage
    }

    /// Keys on the recency list, oldest first.
    #[cfg(test)]
    fn lru_keys(&self) -> Vec<Bytes> {
        let state = self.state.lock();
        let mut keys = Vec::new();
        let mut cursor = state.head;
        while let Some(idx) = cursor {
            let node = state.node(idx);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}

fn free_all<V>(deleted: Vec<LruHandle<V>>) {
    for node in deleted {
        node.free();
    }
}

impl<V: Send + Sync> CacheShard<V> for LruCacheShard<V> {
    fn insert(
        &self,
        key: Bytes,
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
        priority: Priority,
        pin: bool,
    ) -> Result<Option<PinnedEntry<V>>, InsertError<V>> {
        let mut deleted = Vec::new();
        let result = {
            let mut state = self.state.lock();
            state.evict_from_lru(charge, &mut deleted);

            let pinned_usage = state.usage - state.lru_usage;
            if pinned_usage + charge > state.capacity && (state.strict_capacity_limit || !pin) {
                if state.strict_capacity_limit {
                    tracing::trace!(charge, pinned_usage, "cache insert rejected, shard full");
                    Err(InsertError::new(value, charge))
                } else {
                    // Behaves as if inserted and evicted right away.
                    deleted.push(LruHandle {
                        key,
                        hash,
                        value: Arc::new(value),
                        deleter,
                        charge,
                        id: 0,
                        refs: 0,
                        in_cache: false,
                        is_high_pri: false,
                        in_high_pri_pool: false,
                        has_hit: false,
                        prev: None,
                        next: None,
                    });
                    Ok(None)
                }
            } else {
                let id = state.next_id;
                state.next_id += 1;
                let idx = state.allocate(LruHandle {
                    key: key.clone(),
                    hash,
                    value: Arc::new(value),
                    deleter,
                    charge,
                    id,
                    refs: u32::from(pin),
                    in_cache: true,
                    is_high_pri: priority == Priority::High,
                    in_high_pri_pool: false,
                    has_hit: false,
                    prev: None,
                    next: None,
                });

                if let Some(old) = state.table.insert(key, idx) {
                    let old_node = state.node_mut(old);
                    old_node.in_cache = false;
                    if old_node.refs == 0 {
                        state.lru_remove(old);
                        let old_node = state.take_slot(old);
                        state.usage -= old_node.charge;
                        deleted.push(old_node);
                    }
                }
                state.usage += charge;

                if pin {
                    Ok(Some(state.node(idx).pinned(idx)))
                } else {
                    state.lru_insert(idx);
                    Ok(None)
                }
            }
        };

        free_all(deleted);
        result
    }

    fn lookup(&self, key: &[u8], hash: u32) -> Option<PinnedEntry<V>> {
        let mut state = self.state.lock();
        let idx = state.find(key, hash)?;

        if state.node(idx).refs == 0 {
            state.lru_remove(idx);
        }
        let node = state.node_mut(idx);
        node.refs += 1;
        node.has_hit = true;
        Some(node.pinned(idx))
    }

    fn ref_entry(&self, slot: usize, id: u64) -> bool {
        let mut state = self.state.lock();
        if !state.live_slot(slot, id) {
            return false;
        }

        let node = state.node(slot);
        if node.refs == 0 {
            if !node.in_cache {
                return false;
            }
            state.lru_remove(slot);
        }
        state.node_mut(slot).refs += 1;
        true
    }

    fn release(&self, slot: usize, id: u64, force_erase: bool) -> bool {
        let freed = {
            let mut state = self.state.lock();
            if !state.live_slot(slot, id) || state.node(slot).refs == 0 {
                return false;
            }

            let node = state.node_mut(slot);
            node.refs -= 1;
            let mut last_reference = node.refs == 0;
            let in_cache = node.in_cache;

            if last_reference && in_cache {
                if state.usage > state.capacity || force_erase {
                    let key = state.node(slot).key.clone();
                    state.table.remove(&key);
                    state.node_mut(slot).in_cache = false;
                } else {
                    state.lru_insert(slot);
                    last_reference = false;
                }
            }

            if last_reference {
                let node = state.take_slot(slot);
                state.usage -= node.charge;
                Some(node)
            } else {
                None
            }
        };

        match freed {
            Some(node) => {
                node.free();
                true
            }
            None => false,
        }
    }

    fn erase(&self, key: &[u8], hash: u32) {
        let freed = {
            let mut state = self.state.lock();
            let Some(idx) = state.find(key, hash) else {
                return;
            };
            state.table.remove(key);

            let node = state.node_mut(idx);
            node.in_cache = false;
            if node.refs == 0 {
                state.lru_remove(idx);
                let node = state.take_slot(idx);
                state.usage -= node.charge;
                Some(node)
            } else {
                None
            }
        };

        if let Some(node) = freed {
            node.free();
        }
    }

    fn set_capacity(&self, capacity: usize) {
        let mut deleted = Vec::new();
        {
            let mut state = self.state.lock();
            state.capacity = capacity;
            state.set_pool_capacity();
            state.maintain_pool_size();
            state.evict_from_lru(0, &mut deleted);
        }
        free_all(deleted);
    }

    fn set_strict_capacity_limit(&self, strict_capacity_limit: bool) {
        self.state.lock().strict_capacity_limit = strict_capacity_limit;
    }

    fn set_high_priority_pool_ratio(&self, ratio: f64) {
        let mut state = self.state.lock();
        state.high_pri_pool_ratio = ratio;
        state.set_pool_capacity();
        state.maintain_pool_size();
    }

    fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn usage(&self) -> usize {
        self.state.lock().usage
    }

    fn pinned_usage(&self) -> usize {
        let state = self.state.lock();
        state.usage - state.lru_usage
    }

    fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    fn apply_to_all_entries(&self, callback: &mut dyn FnMut(&[u8], &V, usize), thread_safe: bool) {
        if thread_safe {
            let state = self.state.lock();
            for &idx in state.table.values() {
                let node = state.node(idx);
                callback(&node.key, &node.value, node.charge);
            }
            return;
        }

        let snapshot: Vec<(Bytes, Arc<V>, usize)> = {
            let state = self.state.lock();
            state
                .table
                .values()
                .map(|&idx| {
                    let node = state.node(idx);
                    (node.key.clone(), Arc::clone(&node.value), node.charge)
                })
                .collect()
        };
        for (key, value, charge) in &snapshot {
            callback(key, value, *charge);
        }
    }

    fn erase_unref_entries(&self) -> usize {
        let mut deleted = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(idx) = state.head {
                state.lru_remove(idx);
                let node = state.take_slot(idx);
                state.table.remove(&node.key);
                state.usage -= node.charge;
                deleted.push(node);
            }
        }
        let count = deleted.len();
        free_all(deleted);
        count
    }

    fn printable_options(&self) -> String {
        format!(
            "    high_pri_pool_ratio: {:.3}\n",
            self.state.lock().high_pri_pool_ratio
        )
    }

    fn name(&self) -> &'static str {
        "LRUCache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn insert(shard: &LruCacheShard<i32>, k: &str, v: i32, charge: usize, priority: Priority) {
        shard
            .insert(key(k), 0, v, charge, None, priority, false)
            .unwrap();
    }

    fn lookup_release(shard: &LruCacheShard<i32>, k: &str) -> Option<i32> {
        let entry = shard.lookup(k.as_bytes(), 0)?;
        let value = *entry.value;
        shard.release(entry.slot, entry.id, false);
        Some(value)
    }

    fn counting_deleter(counter: &Arc<AtomicUsize>) -> Option<Deleter<i32>> {
        let counter = Arc::clone(counter);
        Some(Box::new(move |_key: &[u8], _value: &i32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_lru_shard_lru_order() {
        let shard = LruCacheShard::new(3, false, 0.0);

        insert(&shard, "1", 10, 1, Priority::Low);
        insert(&shard, "2", 20, 1, Priority::Low);
        insert(&shard, "3", 30, 1, Priority::Low);

        // Access 1 to make it recently used
        assert_eq!(lookup_release(&shard, "1"), Some(10));

        // Insert 4 - should evict 2 (least recently used)
        insert(&shard, "4", 40, 1, Priority::Low);

        assert_eq!(lookup_release(&shard, "2"), None);
        assert_eq!(lookup_release(&shard, "1"), Some(10));
        assert_eq!(lookup_release(&shard, "3"), Some(30));
        assert_eq!(lookup_release(&shard, "4"), Some(40));
    }

    #[test]
    fn test_high_priority_pool_evicted_last() {
        let shard = LruCacheShard::new(4, false, 0.5);

        insert(&shard, "h1", 1, 1, Priority::High);
        insert(&shard, "h2", 2, 1, Priority::High);
        insert(&shard, "l1", 3, 1, Priority::Low);
        insert(&shard, "l2", 4, 1, Priority::Low);
        assert_eq!(shard.lru_keys(), vec![key("l1"), key("l2"), key("h1"), key("h2")]);
        assert_eq!(shard.high_pri_pool_usage(), 2);

        // New low-priority entries push out the old low-priority ones first.
        insert(&shard, "l3", 5, 1, Priority::Low);
        assert_eq!(lookup_release(&shard, "l1"), None);
        assert_eq!(lookup_release(&shard, "h1"), Some(1));
        assert_eq!(lookup_release(&shard, "h2"), Some(2));
    }

    #[test]
    fn test_high_priority_pool_overflow_demotes_oldest() {
        let shard = LruCacheShard::new(4, false, 0.5);

        insert(&shard, "h1", 1, 1, Priority::High);
        insert(&shard, "h2", 2, 1, Priority::High);
        insert(&shard, "h3", 3, 1, Priority::High);

        // Pool holds 2 bytes, so h1 becomes the newest low-priority entry.
        assert_eq!(shard.high_pri_pool_usage(), 2);
        assert_eq!(shard.lru_keys(), vec![key("h1"), key("h2"), key("h3")]);

        insert(&shard, "l1", 4, 1, Priority::Low);
        assert_eq!(shard.lru_keys(), vec![key("h1"), key("l1"), key("h2"), key("h3")]);
    }

    #[test]
    fn test_hit_entries_enter_high_pool() {
        let shard = LruCacheShard::new(4, false, 0.5);
        insert(&shard, "a", 1, 1, Priority::Low);
        insert(&shard, "b", 2, 1, Priority::Low);

        assert_eq!(lookup_release(&shard, "a"), Some(1));
        assert_eq!(shard.high_pri_pool_usage(), 1);
        assert_eq!(shard.lru_keys(), vec![key("b"), key("a")]);
    }

    #[test]
    fn test_pinned_entry_survives_eviction() {
        let shard = LruCacheShard::new(2, false, 0.0);
        let pinned = shard
            .insert(key("p"), 0, 1, 1, None, Priority::Low, true)
            .unwrap()
            .unwrap();

        insert(&shard, "a", 2, 1, Priority::Low);
        insert(&shard, "b", 3, 1, Priority::Low);

        assert_eq!(shard.pinned_usage(), 1);
        assert_eq!(lookup_release(&shard, "a"), None);
        assert_eq!(lookup_release(&shard, "p"), Some(1));
        assert!(!shard.release(pinned.slot, pinned.id, false));
    }

    #[test]
    fn test_strict_limit_rejects_and_returns_value() {
        let shard = LruCacheShard::new(10, true, 0.0);
        let pinned = shard
            .insert(key("a"), 0, 1, 10, None, Priority::Low, true)
            .unwrap()
            .unwrap();

        let err = shard
            .insert(key("b"), 0, 2, 10, None, Priority::Low, false)
            .err()
            .unwrap();
        assert_eq!(err.into_value(), 2);
        assert_eq!(shard.len(), 1);

        assert!(!shard.release(pinned.slot, pinned.id, false));
        insert(&shard, "b", 2, 10, Priority::Low);
        assert_eq!(lookup_release(&shard, "a"), None);
        assert_eq!(lookup_release(&shard, "b"), Some(2));
    }

    #[test]
    fn test_non_strict_unpinned_overflow_is_dropped() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let shard = LruCacheShard::new(10, false, 0.0);
        let _pinned = shard
            .insert(key("a"), 0, 1, 10, None, Priority::Low, true)
            .unwrap()
            .unwrap();

        let res = shard.insert(key("b"), 0, 2, 5, counting_deleter(&deletes), Priority::Low, false);
        assert!(matches!(res, Ok(None)));
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert!(shard.lookup(b"b", 0).is_none());

        // A pinned insert is allowed to overcommit.
        let over = shard
            .insert(key("c"), 0, 3, 5, None, Priority::Low, true)
            .unwrap()
            .unwrap();
        assert_eq!(shard.usage(), 15);
        // Released while over capacity, so it is freed at once.
        assert!(shard.release(over.slot, over.id, false));
        assert_eq!(shard.usage(), 10);
    }

    #[test]
    fn test_erase_defers_free_until_release() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let shard = LruCacheShard::new(10, false, 0.0);
        let entry = shard
            .insert(key("a"), 7, 1, 1, counting_deleter(&deletes), Priority::Low, true)
            .unwrap()
            .unwrap();

        shard.erase(b"a", 7);
        assert!(shard.lookup(b"a", 7).is_none());
        assert_eq!(deletes.load(Ordering::SeqCst), 0);
        assert_eq!(shard.usage(), 1);

        assert!(shard.release(entry.slot, entry.id, false));
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert_eq!(shard.usage(), 0);
    }

    #[test]
    fn test_replace_key_frees_old_entry() {
        let deletes = Arc::new(AtomicUsize::new(0));
        let shard = LruCacheShard::new(10, false, 0.0);
        shard
            .insert(key("k"), 0, 1, 2, counting_deleter(&deletes), Priority::Low, false)
            .unwrap();
        shard
            .insert(key("k"), 0, 2, 3, counting_deleter(&deletes), Priority::Low, false)
            .unwrap();

        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        assert_eq!(shard.usage(), 3);
        assert_eq!(lookup_release(&shard, "k"), Some(2));
    }

    #[test]
    fn test_lookup_with_other_hash_misses() {
        let shard = LruCacheShard::new(10, false, 0.0);
        shard
            .insert(key("k"), 1, 1, 1, None, Priority::Low, false)
            .unwrap();
        assert!(shard.lookup(b"k", 2).is_none());
        assert!(shard.lookup(b"k", 1).is_some());
    }

    #[test]
    fn test_set_capacity_evicts_unpinned() {
        let shard = LruCacheShard::new(10, false, 0.0);
        for (i, k) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            insert(&shard, k, i as i32, 2, Priority::Low);
        }
        assert_eq!(shard.usage(), 10);

        shard.set_capacity(4);
        assert_eq!(shard.usage(), 4);
        assert_eq!(shard.lru_keys(), vec![key("d"), key("e")]);
    }

    #[test]
    fn test_erase_unref_entries() {
        let shard = LruCacheShard::new(10, false, 0.0);
        insert(&shard, "a", 1, 1, Priority::Low);
        insert(&shard, "b", 2, 1, Priority::Low);
        let pinned = shard.lookup(b"a", 0).unwrap();

        assert_eq!(shard.erase_unref_entries(), 1);
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.usage(), 1);
        shard.release(pinned.slot, pinned.id, false);
    }

    #[test]
    fn test_force_erase_on_release() {
        let shard = LruCacheShard::new(10, false, 0.0);
        let entry = shard
            .insert(key("a"), 0, 1, 1, None, Priority::Low, true)
            .unwrap()
            .unwrap();
        assert!(shard.release(entry.slot, entry.id, true));
        assert!(shard.is_empty());
    }

    #[test]
    fn test_ref_entry_checks_identity() {
        let shard = LruCacheShard::new(10, false, 0.0);
        let entry = shard
            .insert(key("a"), 0, 1, 1, None, Priority::Low, true)
            .unwrap()
            .unwrap();
        assert!(shard.ref_entry(entry.slot, entry.id));
        assert!(!shard.release(entry.slot, entry.id, true));
        // The second reference frees it.
        assert!(shard.release(entry.slot, entry.id, true));
        assert!(!shard.ref_entry(entry.slot, entry.id));
    }
}
