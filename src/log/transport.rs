use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::types::{Result, Timestamp};

/// A record delivered by a [`Log`].
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Instance that appended the record.
    pub sender_id: String,
    /// Record payload.
    pub content: Bytes,
    /// Time the log accepted the record.
    pub timestamp: Timestamp,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender_id", &self.sender_id)
            .field("len", &self.content.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Callback invoked for every message of a log it is registered on.
///
/// Readers may be invoked concurrently and must do their own synchronization.
pub trait MessageReader: Send + Sync {
    /// Handles one message. Failures are the reader's to log and count.
    fn read(&self, message: &Message);
}

/// Where a newly registered reader starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadMarker {
    /// Only messages appended after registration.
    FromNow,
    /// Every message accepted at or after the given time.
    FromTime(Timestamp),
    /// Resume after the last message delivered under the identifier, or from now.
    FromIdentifierOrNow(String),
    /// Resume after the last message delivered under the identifier, or from the time.
    FromIdentifierOrTime(String, Timestamp),
}

impl ReadMarker {
    /// Identifier under which read progress is tracked, if any.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ReadMarker::FromIdentifierOrNow(id) | ReadMarker::FromIdentifierOrTime(id, _) => {
                Some(id)
            }
            _ => None,
        }
    }
}

/// Handle returned by [`Log::register_reader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReaderId(pub u64);

/// An append-only, multi-reader message log.
pub trait Log: Send + Sync {
    /// Log name.
    fn name(&self) -> &str;

    /// Appends `content`; returns once the log has accepted it.
    fn add(&self, content: Bytes) -> Result<Message>;

    /// Starts delivering messages to `reader` from `marker`.
    fn register_reader(&self, marker: ReadMarker, reader: Arc<dyn MessageReader>)
        -> Result<ReaderId>;

    /// Stops deliveries to a reader; returns whether it was registered.
    fn unregister_reader(&self, id: ReaderId) -> bool;

    /// Unregisters all readers and rejects further appends.
    fn close(&self) -> Result<()>;
}

/// Opens logs by name.
pub trait LogManager: Send + Sync {
    /// Sender id stamped on messages appended through this manager.
    fn sender_id(&self) -> &str;

    /// Returns the log called `name`, opening it on first use.
    fn open_log(&self, name: &str) -> Result<Arc<dyn Log>>;

    /// Closes every log opened through this manager.
    fn close(&self) -> Result<()>;
}
