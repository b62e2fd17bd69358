//! Stress tests for concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use kvcore::{
    new_lru_cache, slice_hash, LruCacheOptions, Priority, SubCode, TransactionDbOptions, TransactionManager,
    TransactionOptions,
};

/// Route library logs to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Test concurrent inserts and lookups across shards.
#[test]
fn stress_concurrent_cache_access() {
    let opts = LruCacheOptions {
        capacity: 64 * 1024,
        num_shard_bits: 4,
        strict_capacity_limit: false,
        high_pri_pool_ratio: 0.5,
    };
    let cache = Arc::new(new_lru_cache::<Vec<u8>>(&opts).unwrap());
    let num_threads = 8;
    let ops_per_thread = 2000;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let key = format!("key{:05}", (i * 7 + t * 13) % 500);
                    let hash = slice_hash(key.as_bytes());
                    match cache.lookup(key.as_bytes(), hash) {
                        Some(handle) => assert_eq!(handle.as_slice(), key.as_bytes()),
                        None => {
                            let priority = if i % 3 == 0 { Priority::High } else { Priority::Low };
                            let value = key.as_bytes().to_vec();
                            cache
                                .insert(Bytes::from(key), hash, value, 256, None, priority)
                                .unwrap();
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // Nothing is pinned any more, so every shard is back within capacity.
    assert_eq!(cache.pinned_usage(), 0);
    assert!(cache.usage() <= cache.capacity());
}

/// Pinned entries survive insert pressure from other threads.
#[test]
fn stress_pinned_entries_survive_eviction() {
    let opts = LruCacheOptions {
        capacity: 4096,
        num_shard_bits: 2,
        strict_capacity_limit: false,
        high_pri_pool_ratio: 0.0,
    };
    let cache = Arc::new(new_lru_cache::<u64>(&opts).unwrap());
    let freed_pinned = Arc::new(AtomicBool::new(false));

    let mut pinned = Vec::new();
    for i in 0..8u64 {
        let key = format!("pinned{}", i);
        let hash = slice_hash(key.as_bytes());
        let flag = Arc::clone(&freed_pinned);
        let handle = cache
            .insert_with_handle(
                Bytes::from(key),
                hash,
                i,
                64,
                Some(Box::new(move |_: &[u8], _: &u64| flag.store(true, Ordering::SeqCst))),
                Priority::Low,
            )
            .unwrap();
        pinned.push(handle);
    }

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..5000u64 {
                    let key = format!("churn{}_{}", t, i);
                    let hash = slice_hash(key.as_bytes());
                    cache.insert(Bytes::from(key), hash, i, 128, None, Priority::Low).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    assert!(!freed_pinned.load(Ordering::SeqCst));
    for (i, handle) in pinned.iter().enumerate() {
        assert_eq!(**handle, i as u64);
        let key = format!("pinned{}", i);
        assert!(cache.lookup(key.as_bytes(), slice_hash(key.as_bytes())).is_some());
    }
    drop(pinned);
    assert_eq!(cache.pinned_usage(), 0);
}

/// Readers and writers on a few hot keys never overlap.
#[test]
fn stress_lock_exclusivity() {
    let opts = TransactionDbOptions {
        num_stripes: 4,
        transaction_lock_timeout: -1,
        ..Default::default()
    };
    let mgr = Arc::new(TransactionManager::new(opts).unwrap());
    mgr.lock_manager().add_column_family(0);

    // Per key: -1 while exclusively held, otherwise the number of readers.
    let holders: Arc<HashMap<u32, AtomicI64>> = Arc::new((0..4).map(|k| (k, AtomicI64::new(0))).collect());
    let num_threads = 8;
    let rounds = 300;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let mgr = Arc::clone(&mgr);
            let holders = Arc::clone(&holders);
            thread::spawn(move || {
                for i in 0..rounds {
                    let k = ((t + i) % 4) as u32;
                    let key = format!("hot{}", k);
                    let exclusive = (t + i) % 3 == 0;
                    let txn = mgr.begin().unwrap();
                    mgr.lock(&txn, 0, key.as_bytes(), exclusive).unwrap();

                    let state = &holders[&k];
                    if exclusive {
                        assert_eq!(state.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst), Ok(0));
                        thread::yield_now();
                        state.store(0, Ordering::SeqCst);
                    } else {
                        assert!(state.fetch_add(1, Ordering::SeqCst) >= 0);
                        thread::yield_now();
                        state.fetch_sub(1, Ordering::SeqCst);
                    }

                    mgr.transaction_ended(&txn);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(mgr.lock_manager().point_lock_status().is_empty());
    assert_eq!(mgr.active_count(), 0);
}

/// Transactions locking key pairs in opposite orders either succeed or get
/// a deadlock error; nobody hangs.
#[test]
fn stress_deadlock_detection() {
    init_tracing();
    let opts = TransactionDbOptions {
        transaction_lock_timeout: 5_000_000,
        max_num_deadlocks: 100,
        ..Default::default()
    };
    let mgr = Arc::new(TransactionManager::new(opts).unwrap());
    mgr.lock_manager().add_column_family(0);
    let deadlocks = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|t| {
            let mgr = Arc::clone(&mgr);
            let deadlocks = Arc::clone(&deadlocks);
            thread::spawn(move || {
                let txn_opts = TransactionOptions {
                    deadlock_detect: true,
                    ..Default::default()
                };
                for i in 0..100 {
                    let (first, second) = if (t + i) % 2 == 0 { ("a", "b") } else { ("b", "a") };
                    let txn = mgr.begin_with_options(&txn_opts).unwrap();
                    let result = mgr
                        .lock(&txn, 0, first.as_bytes(), true)
                        .and_then(|_| mgr.lock(&txn, 0, second.as_bytes(), true));
                    match result {
                        Ok(()) => {}
                        Err(err) => {
                            assert_eq!(err.subcode(), Some(SubCode::Deadlock), "unexpected error: {}", err);
                            deadlocks.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    mgr.transaction_ended(&txn);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert!(mgr.lock_manager().point_lock_status().is_empty());
    let recorded = mgr.lock_manager().deadlock_info_buffer();
    assert_eq!(recorded.len(), deadlocks.load(Ordering::SeqCst).min(100));
    assert!(recorded.iter().all(|p| p.limit_exceeded || p.path.len() >= 2));
}

/// Resizing the stripe table while transactions lock and unlock.
#[test]
fn stress_resize_during_locking() {
    init_tracing();
    let opts = TransactionDbOptions {
        num_stripes: 2,
        transaction_lock_timeout: -1,
        ..Default::default()
    };
    let mgr = Arc::new(TransactionManager::new(opts).unwrap());
    mgr.lock_manager().add_column_family(0);
    mgr.lock_manager().add_column_family(1);
    let done = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let txn = mgr.begin().unwrap();
                    let cf = i % 2;
                    let key = format!("key{}", (i + t) % 16);
                    mgr.lock(&txn, cf, key.as_bytes(), i % 4 == 0).unwrap();
                    mgr.lock(&txn, cf, format!("own{}_{}", t, i).as_bytes(), true).unwrap();
                    mgr.transaction_ended(&txn);
                }
            })
        })
        .collect();

    let resizer = {
        let mgr = Arc::clone(&mgr);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut n = 2;
            while !done.load(Ordering::SeqCst) {
                n = n % 31 + 1;
                mgr.lock_manager().resize(n).unwrap();
                thread::yield_now();
            }
        })
    };

    for w in workers {
        w.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    resizer.join().unwrap();

    assert!(mgr.lock_manager().point_lock_status().is_empty());
    assert_eq!(mgr.lock_manager().num_locks(0).unwrap(), 0);
    assert_eq!(mgr.lock_manager().num_locks(1).unwrap(), 0);
}
