//! Crash recovery driven by the system transaction log.
//!
//! A [`TransactionLogProcessor`] tails the log and folds each transaction's
//! status records into a [`TxEntry`]. Entries expire from a [`TxCache`] after
//! the commit-time bound; an entry that never confirmed its secondary effects
//! is handed to the [`RepairPipeline`], which restores the affected external
//! indexes and re-delivers the commit to its user log.

mod cache;
mod entry;
mod processor;
mod repair;

pub use cache::{EvictionListener, TxCache};
pub use entry::{TxEntry, TxSnapshot};
pub use processor::{RecoveryStats, TransactionLogProcessor, TransactionLogProcessorBuilder};
pub use repair::{RepairPipeline, RepairReport};
