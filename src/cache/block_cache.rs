//! Block cache for table data blocks.
//!
//! Every table file is assigned a cache id prefix the first time one of its
//! blocks is cached. Block keys are `varint(prefix) ++ varint(offset)`, so
//! a file's blocks share a byte prefix and can be invalidated together.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::InsertError;
use crate::options::LruCacheOptions;
use crate::util::coding::{decode_varint64, encode_varint64, varint_length};
use crate::util::hash::slice_hash;
use crate::Result;

use super::shard::Priority;
use super::sharded::{new_lru_cache, CacheStats, Handle, LruCache};

/// Cached block data.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    /// Decoded block data.
    pub data: Bytes,
}

impl CachedBlock {
    /// Create a new cached block.
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Size in bytes, used as the cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Block cache for table data blocks.
///
/// Capacity is in bytes; each block is charged its length.
pub struct BlockCache {
    cache: LruCache<CachedBlock>,
    /// file number -> cache id prefix
    prefixes: Mutex<HashMap<u64, u64>>,
}

impl BlockCache {
    /// Create a new block cache with the given options.
    pub fn new(options: &LruCacheOptions) -> Result<Self> {
        Ok(Self {
            cache: new_lru_cache(options)?,
            prefixes: Mutex::new(HashMap::new()),
        })
    }

    /// Create a block cache of `capacity` bytes with default options.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(&LruCacheOptions::new(capacity))
    }

    fn prefix(&self, file_number: u64) -> u64 {
        *self
            .prefixes
            .lock()
            .entry(file_number)
            .or_insert_with(|| self.cache.new_id())
    }

    fn existing_prefix(&self, file_number: u64) -> Option<u64> {
        self.prefixes.lock().get(&file_number).copied()
    }

    fn block_key(prefix: u64, block_offset: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(varint_length(prefix) + varint_length(block_offset));
        encode_varint64(&mut buf, prefix);
        encode_varint64(&mut buf, block_offset);
        buf.freeze()
    }

    /// Get a pinned block from the cache.
    pub fn get(&self, file_number: u64, block_offset: u64) -> Option<Handle<CachedBlock>> {
        let Some(prefix) = self.existing_prefix(file_number) else {
            self.cache.stats().misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        };
        let key = Self::block_key(prefix, block_offset);
        self.cache.lookup(&key, slice_hash(&key))
    }

    /// Insert a block into the cache.
    pub fn insert(
        &self,
        file_number: u64,
        block_offset: u64,
        block: CachedBlock,
        priority: Priority,
    ) -> std::result::Result<(), InsertError<CachedBlock>> {
        let key = Self::block_key(self.prefix(file_number), block_offset);
        let hash = slice_hash(&key);
        let charge = block.size();
        self.cache.insert(key, hash, block, charge, None, priority)
    }

    /// Insert a block and keep it pinned.
    pub fn insert_pinned(
        &self,
        file_number: u64,
        block_offset: u64,
        block: CachedBlock,
        priority: Priority,
    ) -> std::result::Result<Handle<CachedBlock>, InsertError<CachedBlock>> {
        let key = Self::block_key(self.prefix(file_number), block_offset);
        let hash = slice_hash(&key);
        let charge = block.size();
        self.cache
            .insert_with_handle(key, hash, block, charge, None, priority)
    }

    /// Remove a single block.
    pub fn erase(&self, file_number: u64, block_offset: u64) {
        if let Some(prefix) = self.existing_prefix(file_number) {
            let key = Self::block_key(prefix, block_offset);
            self.cache.erase(&key, slice_hash(&key));
        }
    }

    /// Invalidate all blocks for a specific file.
    ///
    /// Called when a file is deleted. Pinned blocks stay readable through
    /// their handles until released.
    pub fn invalidate_file(&self, file_number: u64) {
        let Some(prefix) = self.prefixes.lock().remove(&file_number) else {
            return;
        };

        let mut keys = Vec::new();
        self.cache.apply_to_all_cache_entries(
            |key, _block, _charge| {
                let mut rest = key;
                if decode_varint64(&mut rest) == Some(prefix) {
                    keys.push(Bytes::copy_from_slice(key));
                }
            },
            true,
        );
        for key in &keys {
            self.cache.erase(key, slice_hash(key));
        }
        tracing::debug!(file_number, blocks = keys.len(), "invalidated cached blocks");
    }

    /// Get the number of cached blocks.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Bytes currently charged to the cache.
    pub fn usage(&self) -> usize {
        self.cache.usage()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }

    /// Drop every block that is not pinned.
    pub fn clear(&self) {
        self.cache.erase_unref_entries();
    }
}
