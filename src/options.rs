//! Configuration options for the block cache and the lock manager.

use crate::{Error, Result};

/// Default block cache size (8MB).
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 8 * 1024 * 1024;

/// Default fraction of a cache shard reserved for high-priority entries.
pub const DEFAULT_HIGH_PRI_POOL_RATIO: f64 = 0.5;

/// Shard bit counts at or above this are rejected.
pub const MAX_NUM_SHARD_BITS: i32 = 20;

/// Default number of lock stripes per column family.
pub const DEFAULT_NUM_STRIPES: usize = 16;

/// Default lock wait timeout for transactions (1s, in microseconds).
pub const DEFAULT_LOCK_TIMEOUT_US: i64 = 1_000_000;

/// Default number of recent deadlocks retained for diagnostics.
pub const DEFAULT_MAX_NUM_DEADLOCKS: u32 = 5;

/// Default deadlock search depth.
pub const DEFAULT_DEADLOCK_DETECT_DEPTH: i64 = 50;

/// Options for an LRU block cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LruCacheOptions {
    /// Total capacity in bytes, split evenly across shards.
    pub capacity: usize,

    /// The cache is sharded into `2^num_shard_bits` shards.
    /// `-1` derives the value from `capacity`.
    pub num_shard_bits: i32,

    /// Reject inserts that would exceed capacity instead of overcommitting.
    pub strict_capacity_limit: bool,

    /// Fraction of each shard's capacity reserved for high-priority entries
    /// (0.0 disables the high-priority pool).
    pub high_pri_pool_ratio: f64,
}

impl Default for LruCacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BLOCK_CACHE_SIZE,
            num_shard_bits: -1,
            strict_capacity_limit: false,
            high_pri_pool_ratio: DEFAULT_HIGH_PRI_POOL_RATIO,
        }
    }
}

impl LruCacheOptions {
    /// Create options for a cache of `capacity` bytes with defaults otherwise.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.num_shard_bits >= MAX_NUM_SHARD_BITS {
            return Err(Error::invalid_configuration(format!(
                "num_shard_bits must be less than {}",
                MAX_NUM_SHARD_BITS
            )));
        }

        if !(0.0..=1.0).contains(&self.high_pri_pool_ratio) {
            return Err(Error::invalid_configuration(
                "high_pri_pool_ratio must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }

    /// Parse cache options from a configuration string.
    ///
    /// Accepts either a bare size (`"8M"`, `"1048576"`) or a `;`-separated
    /// list of `name=value` pairs, e.g.
    /// `"capacity=1M;num_shard_bits=4;strict_capacity_limit=true"`.
    pub fn from_config_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if !value.contains('=') {
            return Ok(Self::new(parse_size(value)?));
        }

        let mut opts = Self::default();
        for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, raw) = pair.split_once('=').ok_or_else(|| {
                Error::invalid_configuration(format!("Mismatched option: {}", pair))
            })?;
            let raw = raw.trim();
            match name.trim() {
                "capacity" => opts.capacity = parse_size(raw)?,
                "num_shard_bits" => {
                    opts.num_shard_bits = raw.parse().map_err(|_| invalid_value(name, raw))?
                }
                "strict_capacity_limit" => {
                    opts.strict_capacity_limit = parse_bool(raw).ok_or_else(|| invalid_value(name, raw))?
                }
                "high_pri_pool_ratio" => {
                    opts.high_pri_pool_ratio = raw.parse().map_err(|_| invalid_value(name, raw))?
                }
                other => {
                    return Err(Error::invalid_configuration(format!(
                        "Unrecognized cache option: {}",
                        other
                    )))
                }
            }
        }

        opts.validate()?;
        Ok(opts)
    }
}

fn invalid_value(name: &str, raw: &str) -> Error {
    Error::invalid_configuration(format!("Invalid value for {}: {}", name.trim(), raw))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a byte size with an optional `k`/`m`/`g`/`t` suffix.
pub fn parse_size(raw: &str) -> Result<usize> {
    let raw = raw.trim();
    let (digits, shift) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                _ => return Err(Error::invalid_configuration(format!("Invalid size: {}", raw))),
            };
            (&raw[..idx], shift)
        }
        _ => (raw, 0),
    };

    let base: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_configuration(format!("Invalid size: {}", raw)))?;
    base.checked_shl(shift)
        .filter(|v| v >> shift == base)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| Error::invalid_configuration(format!("Size out of range: {}", raw)))
}

/// Builder for LruCacheOptions.
#[derive(Debug, Clone, Default)]
pub struct LruCacheOptionsBuilder {
    options: LruCacheOptions,
}

impl LruCacheOptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set capacity in bytes.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.options.capacity = capacity;
        self
    }

    /// Set num_shard_bits (-1 derives it from capacity).
    pub fn num_shard_bits(mut self, bits: i32) -> Self {
        self.options.num_shard_bits = bits;
        self
    }

    /// Set strict_capacity_limit.
    pub fn strict_capacity_limit(mut self, value: bool) -> Self {
        self.options.strict_capacity_limit = value;
        self
    }

    /// Set high_pri_pool_ratio.
    pub fn high_pri_pool_ratio(mut self, ratio: f64) -> Self {
        self.options.high_pri_pool_ratio = ratio;
        self
    }

    /// Build the options.
    pub fn build(self) -> Result<LruCacheOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Options shared by every transaction of one lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDbOptions {
    /// Maximum number of keys locked per column family (`<= 0` is unlimited).
    pub max_num_locks: i64,

    /// Number of recent deadlocks retained by the deadlock info buffer.
    pub max_num_deadlocks: u32,

    /// Number of lock stripes per column family.
    pub num_stripes: usize,

    /// Lock wait timeout in microseconds used when a transaction does not
    /// set its own. Negative waits forever, zero never blocks.
    pub transaction_lock_timeout: i64,
}

impl Default for TransactionDbOptions {
    fn default() -> Self {
        Self {
            max_num_locks: -1,
            max_num_deadlocks: DEFAULT_MAX_NUM_DEADLOCKS,
            num_stripes: DEFAULT_NUM_STRIPES,
            transaction_lock_timeout: DEFAULT_LOCK_TIMEOUT_US,
        }
    }
}

impl TransactionDbOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.num_stripes == 0 {
            return Err(Error::invalid_configuration(
                "num_stripes must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for TransactionDbOptions.
#[derive(Debug, Clone, Default)]
pub struct TransactionDbOptionsBuilder {
    options: TransactionDbOptions,
}

impl TransactionDbOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_num_locks(mut self, value: i64) -> Self {
        self.options.max_num_locks = value;
        self
    }

    pub fn max_num_deadlocks(mut self, value: u32) -> Self {
        self.options.max_num_deadlocks = value;
        self
    }

    pub fn num_stripes(mut self, value: usize) -> Self {
        self.options.num_stripes = value;
        self
    }

    /// Set the default lock wait timeout in microseconds.
    pub fn transaction_lock_timeout(mut self, micros: i64) -> Self {
        self.options.transaction_lock_timeout = micros;
        self
    }

    pub fn build(self) -> Result<TransactionDbOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Per-transaction locking options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Run deadlock detection before blocking on a conflicting lock.
    pub deadlock_detect: bool,

    /// Maximum number of wait-graph nodes visited by deadlock detection.
    /// A search that would go deeper is reported as a deadlock.
    pub deadlock_detect_depth: i64,

    /// Lock wait timeout in microseconds. Negative uses
    /// `TransactionDbOptions::transaction_lock_timeout`.
    pub lock_timeout: i64,

    /// Time in microseconds after which other transactions may steal this
    /// transaction's locks. Negative means never.
    pub expiration: i64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            deadlock_detect: false,
            deadlock_detect_depth: DEFAULT_DEADLOCK_DETECT_DEPTH,
            lock_timeout: -1,
            expiration: -1,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.deadlock_detect && self.deadlock_detect_depth <= 0 {
            return Err(Error::invalid_configuration(
                "deadlock_detect_depth must be positive",
            ));
        }
        Ok(())
    }
}
