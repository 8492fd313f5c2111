use std::collections::BTreeMap;

use super::claim::LockClaim;
use super::key_column::KeyColumn;
use crate::types::Timestamp;

/// Outcome of a successful claim write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockStatus {
    /// Timestamp encoded in the written claim column.
    pub write_timestamp: Timestamp,
    /// Time after which other writers may treat the claim as abandoned.
    pub expire_timestamp: Timestamp,
    /// Set once seniority and the expected value have been verified.
    pub checked: bool,
    pub(crate) claim: LockClaim,
}

impl LockStatus {
    /// The claim this status was written for.
    pub fn claim(&self) -> &LockClaim {
        &self.claim
    }
}

/// Locks held by one transaction, keyed by guarded cell.
#[derive(Debug, Default)]
pub struct LockerState {
    locks: BTreeMap<KeyColumn, LockStatus>,
}

impl LockerState {
    /// Whether a claim for `kc` has been written.
    pub fn has(&self, kc: &KeyColumn) -> bool {
        self.locks.contains_key(kc)
    }

    /// Status for `kc`.
    pub fn get(&self, kc: &KeyColumn) -> Option<&LockStatus> {
        self.locks.get(kc)
    }

    /// Number of written claims.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no claims are held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub(crate) fn insert(&mut self, kc: KeyColumn, status: LockStatus) {
        self.locks.insert(kc, status);
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&KeyColumn, &mut LockStatus)> {
        self.locks.iter_mut()
    }

    pub(crate) fn take_all(&mut self) -> BTreeMap<KeyColumn, LockStatus> {
        std::mem::take(&mut self.locks)
    }
}
