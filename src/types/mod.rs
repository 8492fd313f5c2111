//! Shared identifiers, timestamps, and the crate-wide error type.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

/// Errors raised by locking, logging, and recovery operations.
#[derive(Debug, Error)]
pub enum UmbralError {
    /// I/O failure from the filesystem.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed bytes were read from a store or log.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Invalid argument or an impossible state reached by a caller.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A backend failure that may succeed if attempted again.
    #[error("temporary backend failure: {0}")]
    TemporaryBackend(String),
    /// A backend failure that will not go away by retrying.
    #[error("permanent backend failure: {0}")]
    PermanentBackend(String),
    /// Lock acquisition failed in a way the caller may retry with a new transaction.
    #[error("temporary locking failure: {0}")]
    TemporaryLocking(String),
    /// Lock acquisition or verification failed; the owning transaction must abort.
    #[error("permanent locking failure: {0}")]
    PermanentLocking(String),
    /// A retried operation did not finish within its time budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The component has been shut down.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// A requested item does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UmbralError>;

impl UmbralError {
    /// Returns `true` when retrying the failed operation may succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            UmbralError::TemporaryBackend(_)
                | UmbralError::TemporaryLocking(_)
                | UmbralError::Timeout(_)
        )
    }

    /// Returns `true` for either flavour of locking failure.
    pub fn is_locking_failure(&self) -> bool {
        matches!(
            self,
            UmbralError::TemporaryLocking(_) | UmbralError::PermanentLocking(_)
        )
    }
}

/// Wall-clock instant in nanoseconds since the UNIX epoch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The zero instant.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Builds a timestamp from milliseconds since the epoch.
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms.saturating_mul(1_000_000))
    }

    /// Raw nanoseconds since the epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns `self + d`, saturating at `u64::MAX`.
    pub fn plus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration_nanos(d)))
    }

    /// Returns `self - d`, saturating at the epoch.
    pub fn minus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration_nanos(d)))
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

pub(crate) fn duration_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Process-unique identifier written into lock claims and log messages.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Rid(Bytes);

impl Rid {
    /// Wraps raw identifier bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Rid(bytes.into())
    }

    /// Generates an identifier from the process id and random bytes.
    pub fn generate() -> Self {
        let mut salt = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut salt);
        let text = format!("{:x}-{}", std::process::id(), hex::encode(salt));
        Rid(Bytes::from(text.into_bytes()))
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cheap clone of the underlying buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({self})")
    }
}

/// Identity of a committed transaction as seen on the transaction log.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId {
    /// Sender id of the instance that committed the transaction.
    pub sender_id: String,
    /// Per-sender transaction counter.
    pub tx_id: u64,
    /// Commit timestamp recorded in the log header.
    pub timestamp: Timestamp,
}

impl TransactionId {
    /// Creates a transaction identity.
    pub fn new(sender_id: impl Into<String>, tx_id: u64, timestamp: Timestamp) -> Self {
        Self {
            sender_id: sender_id.into(),
            tx_id,
            timestamp,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.sender_id, self.tx_id, self.timestamp.0)
    }
}
