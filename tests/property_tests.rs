//! Property tests for the sharded cache.

use bytes::Bytes;
use proptest::prelude::*;

use kvcore::{new_lru_cache, slice_hash, Handle, LruCache, LruCacheOptions, Priority};

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u8, charge: usize, pin: bool, high: bool },
    Lookup { key: u8 },
    Release { index: usize, force: bool },
    Erase { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..32, 1usize..64, any::<bool>(), any::<bool>())
            .prop_map(|(key, charge, pin, high)| Op::Insert { key, charge, pin, high }),
        3 => (0u8..32).prop_map(|key| Op::Lookup { key }),
        3 => (any::<usize>(), any::<bool>()).prop_map(|(index, force)| Op::Release { index, force }),
        1 => (0u8..32).prop_map(|key| Op::Erase { key }),
    ]
}

fn key_bytes(key: u8) -> Bytes {
    Bytes::from(format!("key{:03}", key))
}

fn single_shard(capacity: usize, strict: bool) -> LruCache<u32> {
    let opts = LruCacheOptions {
        capacity,
        num_shard_bits: 0,
        strict_capacity_limit: strict,
        high_pri_pool_ratio: 0.25,
    };
    new_lru_cache(&opts).unwrap()
}

fn table_charge(cache: &LruCache<u32>) -> usize {
    let mut total = 0;
    cache.apply_to_all_cache_entries(|_, _, charge| total += charge, true);
    total
}

fn apply(cache: &LruCache<u32>, held: &mut Vec<Handle<u32>>, op: &Op) {
    match *op {
        Op::Insert { key, charge, pin, high } => {
            let k = key_bytes(key);
            let hash = slice_hash(&k);
            let priority = if high { Priority::High } else { Priority::Low };
            if pin {
                if let Ok(handle) = cache.insert_with_handle(k, hash, u32::from(key), charge, None, priority) {
                    held.push(handle);
                }
            } else {
                let _ = cache.insert(k, hash, u32::from(key), charge, None, priority);
            }
        }
        Op::Lookup { key } => {
            let k = key_bytes(key);
            if let Some(handle) = cache.lookup(&k, slice_hash(&k)) {
                assert_eq!(*handle, u32::from(key));
                held.push(handle);
            }
        }
        Op::Release { index, force } => {
            if !held.is_empty() {
                let handle = held.swap_remove(index % held.len());
                handle.release(force);
            }
        }
        Op::Erase { key } => {
            let k = key_bytes(key);
            cache.erase(&k, slice_hash(&k));
        }
    }
}

proptest! {
    #[test]
    fn strict_limit_never_exceeds_capacity(
        capacity in 16usize..256,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let cache = single_shard(capacity, true);
        let mut held = Vec::new();
        for op in &ops {
            apply(&cache, &mut held, op);
            prop_assert!(cache.usage() <= capacity, "usage {} > capacity {}", cache.usage(), capacity);
            prop_assert!(cache.pinned_usage() <= cache.usage());
        }
    }

    #[test]
    fn usage_matches_entries_once_unpinned(
        strict in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let cache = single_shard(128, strict);
        let mut held = Vec::new();
        for op in &ops {
            apply(&cache, &mut held, op);
        }
        held.clear();

        prop_assert_eq!(cache.pinned_usage(), 0);
        prop_assert_eq!(cache.usage(), table_charge(&cache));
        prop_assert!(cache.usage() <= 128);
    }

    #[test]
    fn shard_index_is_stable_and_in_range(
        bits in 0i32..7,
        keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 1..50),
    ) {
        let opts = LruCacheOptions {
            capacity: 1 << 20,
            num_shard_bits: bits,
            strict_capacity_limit: false,
            high_pri_pool_ratio: 0.0,
        };
        let cache = new_lru_cache::<usize>(&opts).unwrap();
        prop_assert_eq!(cache.num_shards(), 1usize << bits);

        for (i, key) in keys.iter().enumerate() {
            let hash = slice_hash(key);
            let index = cache.shard_index(hash);
            prop_assert!(index < cache.num_shards());
            prop_assert_eq!(index, cache.shard_index(slice_hash(key)));

            cache.insert(Bytes::copy_from_slice(key), hash, i, 1, None, Priority::Low).unwrap();
        }
        // Later duplicates replace earlier ones, so look up the last value per key.
        for (i, key) in keys.iter().enumerate() {
            let last = keys.iter().rposition(|k| k == key).unwrap();
            if last == i {
                let handle = cache.lookup(key, slice_hash(key));
                prop_assert_eq!(handle.map(|h| *h), Some(i));
            }
        }
    }
}
