use parking_lot::Mutex;
use tracing::warn;

use crate::log::{LogEntry, LogTxStatus, SecondaryFailures};
use crate::types::{Result, UmbralError};

/// What recovery knows about one transaction at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxSnapshot {
    /// Most final status observed, if any record arrived.
    pub status: Option<LogTxStatus>,
    /// The `Precommit` record, once seen.
    pub entry: Option<LogEntry>,
    /// Failure detail of a `SecondaryFailure` record.
    pub failures: Option<SecondaryFailures>,
}

impl TxSnapshot {
    /// Whether secondary effects were never confirmed.
    pub fn needs_repair(&self) -> bool {
        matches!(
            self.status,
            Some(LogTxStatus::SecondaryFailure | LogTxStatus::PrimarySuccess)
        )
    }
}

/// Recovery state of one transaction, folded from its log records.
///
/// Records for the same transaction may arrive on several reader threads;
/// each update runs under the entry's own lock.
#[derive(Debug, Default)]
pub struct TxEntry {
    state: Mutex<TxSnapshot>,
}

impl TxEntry {
    /// Creates an entry with no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one record into the entry.
    ///
    /// Statuses only move toward more final ones. A `SecondaryFailure`, once
    /// seen, is never replaced by a later `SecondarySuccess`.
    pub fn update(&self, record: LogEntry) -> Result<()> {
        let mut state = self.state.lock();
        match record.status {
            LogTxStatus::Precommit => {
                if state.status.is_none() {
                    state.status = Some(LogTxStatus::Precommit);
                }
                state.entry = Some(record);
            }
            LogTxStatus::PrimarySuccess | LogTxStatus::CompleteSuccess => {
                if matches!(state.status, None | Some(LogTxStatus::Precommit)) {
                    state.status = Some(record.status);
                }
            }
            LogTxStatus::SecondarySuccess => {
                if state.status == Some(LogTxStatus::SecondaryFailure) {
                    warn!(
                        tx = record.header.tx_id(),
                        "recovery.entry.success_after_failure"
                    );
                } else {
                    state.status = Some(LogTxStatus::SecondarySuccess);
                }
            }
            LogTxStatus::SecondaryFailure => {
                let failures = record.secondary_failures()?;
                state.status = Some(LogTxStatus::SecondaryFailure);
                state.failures = Some(failures);
            }
            LogTxStatus::UserLog => {
                return Err(UmbralError::Invalid(format!(
                    "unexpected {:?} record for transaction {} on the system log",
                    record.status,
                    record.header.tx_id()
                )))
            }
        }
        Ok(())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TxSnapshot {
        self.state.lock().clone()
    }
}
