//! Error types for kvcore.

use std::fmt;

use thiserror::Error;

/// Result type alias for kvcore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Finer classification attached to `TimedOut` and `Busy` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubCode {
    /// Waited for a conflicting lock holder until the timeout elapsed.
    LockTimeout,
    /// Could not acquire the lock stripe mutex within the timeout.
    MutexTimeout,
    /// Acquiring the lock would complete a wait cycle.
    Deadlock,
    /// The column family already holds the maximum number of locks.
    LockLimit,
}

impl fmt::Display for SubCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubCode::LockTimeout => "Timeout waiting to lock key",
            SubCode::MutexTimeout => "Timeout Acquiring Mutex",
            SubCode::Deadlock => "Deadlock",
            SubCode::LockLimit => "Failed to acquire lock due to max_num_locks limit",
        };
        f.write_str(s)
    }
}

/// Error types for cache and lock operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Caller passed an argument the component cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    TimedOut(SubCode),

    /// Resource is busy.
    #[error("Resource busy: {0}")]
    Busy(SubCode),

    /// Operation could not complete, e.g. the cache is full of pinned entries.
    #[error("Result incomplete: {0}")]
    Incomplete(String),

    /// Operation was abandoned before it finished.
    #[error("Operation aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration<S: Into<String>>(msg: S) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    /// Sub-classification of `TimedOut`/`Busy`, if any.
    pub fn subcode(&self) -> Option<SubCode> {
        match self {
            Error::TimedOut(code) | Error::Busy(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Check if a deadlock was detected.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Busy(SubCode::Deadlock))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Check if the caller may retry the same operation unchanged.
    ///
    /// A deadlock is never retryable: the cycle is still there until one
    /// of its transactions releases its locks.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TimedOut(_) | Error::Busy(SubCode::LockLimit) | Error::Incomplete(_)
        )
    }
}

/// A cache insert rejected because the shard is full of pinned entries.
///
/// The value is handed back so the caller keeps ownership of it.
pub struct InsertError<V> {
    value: V,
    charge: usize,
}

impl<V> InsertError<V> {
    pub(crate) fn new(value: V, charge: usize) -> Self {
        Self { value, charge }
    }

    /// Charge of the rejected entry.
    pub fn charge(&self) -> usize {
        self.charge
    }

    /// Borrow the rejected value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Take back ownership of the rejected value.
    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V> fmt::Debug for InsertError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertError")
            .field("charge", &self.charge)
            .finish_non_exhaustive()
    }
}

impl<V> fmt::Display for InsertError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insert failed due to LRU cache being full (charge {})",
            self.charge
        )
    }
}

impl<V> std::error::Error for InsertError<V> {}

impl<V> From<InsertError<V>> for Error {
    fn from(err: InsertError<V>) -> Self {
        Error::Incomplete(err.to_string())
    }
}
