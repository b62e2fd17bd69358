//! Caching infrastructure.
//!
//! - **Shards**: the [`CacheShard`] contract and its LRU implementation
//!   with an optional high-priority pool
//! - **Sharded cache**: routes keys to shards by hash and hands out pinned
//!   [`Handle`]s
//! - **Block Cache**: caches decoded table data blocks

mod block_cache;
mod lru;
mod shard;
mod sharded;

pub use block_cache::{BlockCache, CachedBlock};
pub use lru::LruCacheShard;
pub use shard::{CacheShard, Deleter, PinnedEntry, Priority};
pub use sharded::{default_cache_shard_bits, new_lru_cache, CachePriority, CacheStats, Handle, LruCache, ShardedCache};
