//! Transaction log records and the log transport contract.
//!
//! Every committing transaction appends status records to the system log:
//! a `Precommit` record carrying its modifications, then primary and
//! secondary outcome records. Recovery tails that log; user-facing change
//! processors read user logs carrying `UserLog` copies of commits.

mod header;
mod memory;
mod transport;

pub use header::{
    Change, LogEntry, LogTxMetadata, LogTxStatus, Modification, SecondaryFailures,
    TransactionLogHeader,
};
pub use memory::{MemoryLog, MemoryLogManager};
pub use transport::{Log, LogManager, Message, MessageReader, ReadMarker, ReaderId};
