//! Record of the point locks a transaction holds.

use std::collections::HashMap;

use bytes::Bytes;

/// Locks acquired by one transaction, by column family and key.
#[derive(Debug, Default, Clone)]
pub struct LockTracker {
    /// cf id -> key -> exclusive
    locks: HashMap<u32, HashMap<Bytes, bool>>,
}

impl LockTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lock. An exclusive lock is never weakened by a later shared
    /// acquisition of the same key.
    pub fn track(&mut self, column_family_id: u32, key: Bytes, exclusive: bool) {
        let held = self
            .locks
            .entry(column_family_id)
            .or_default()
            .entry(key)
            .or_insert(exclusive);
        *held |= exclusive;
    }

    /// Forget a lock. Returns true if it was tracked.
    pub fn untrack(&mut self, column_family_id: u32, key: &[u8]) -> bool {
        let Some(keys) = self.locks.get_mut(&column_family_id) else {
            return false;
        };
        let removed = keys.remove(key).is_some();
        if keys.is_empty() {
            self.locks.remove(&column_family_id);
        }
        removed
    }

    /// Whether the key is held, and if so exclusively.
    pub fn get(&self, column_family_id: u32, key: &[u8]) -> Option<bool> {
        self.locks
            .get(&column_family_id)
            .and_then(|keys| keys.get(key))
            .copied()
    }

    /// Check if a lock at least as strong as requested is already held.
    pub fn covers(&self, column_family_id: u32, key: &[u8], exclusive: bool) -> bool {
        match self.get(column_family_id, key) {
            Some(held_exclusive) => held_exclusive || !exclusive,
            None => false,
        }
    }

    pub fn num_column_families(&self) -> usize {
        self.locks.len()
    }

    /// Total number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Iterate over `(column_family_id, key, exclusive)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Bytes, bool)> + '_ {
        self.locks
            .iter()
            .flat_map(|(cf, keys)| keys.iter().map(move |(key, exclusive)| (*cf, key, *exclusive)))
    }

    /// Keys tracked for one column family.
    pub fn keys(&self, column_family_id: u32) -> impl Iterator<Item = &Bytes> + '_ {
        self.locks
            .get(&column_family_id)
            .into_iter()
            .flat_map(|keys| keys.keys())
    }

    /// Clear every tracked lock.
    pub fn clear(&mut self) {
        self.locks.clear();
    }
}
