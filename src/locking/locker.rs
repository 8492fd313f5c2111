use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use super::claim::{lock_column, LockClaim, TimestampRid};
use super::key_column::KeyColumn;
use super::mediator::{LocalLockMediator, MediatorRegistry};
use super::state::{LockStatus, LockerState};
use crate::config::LockerOptions;
use crate::metrics::{default_metrics, ConsistencyMetrics};
use crate::primitives::clock::TimeSource;
use crate::storage::{Entry, KeyColumnValueStore};
use crate::types::{Result, Rid, Timestamp, UmbralError};

/// Identity of a lock-holding transaction inside the local mediator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TxHandle {
    rid: Rid,
    seq: u64,
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.rid, self.seq)
    }
}

/// Locks requested by one transaction.
///
/// Obtain with [`ConsistentKeyLocker::transaction`]; release with
/// [`ConsistentKeyLocker::delete_locks`] on commit or abort.
#[derive(Debug)]
pub struct LockTransaction {
    handle: TxHandle,
    state: LockerState,
}

impl LockTransaction {
    /// Mediator identity of this transaction.
    pub fn handle(&self) -> &TxHandle {
        &self.handle
    }

    /// Claims written so far.
    pub fn state(&self) -> &LockerState {
        &self.state
    }
}

/// Lock orchestrator combining local mediation with claims in a lock store.
///
/// Lifecycle of one lock: local hold, claim written, verified, released.
/// Local contention, lost seniority, and value mismatches are permanent
/// failures. Store trouble while writing claims is temporary.
pub struct ConsistentKeyLocker {
    lock_store: Arc<dyn KeyColumnValueStore>,
    data_store: Arc<dyn KeyColumnValueStore>,
    rid: Rid,
    clock: Arc<dyn TimeSource>,
    mediator: Arc<LocalLockMediator<TxHandle>>,
    options: LockerOptions,
    metrics: Arc<dyn ConsistencyMetrics>,
    next_tx: AtomicU64,
}

impl ConsistentKeyLocker {
    /// Creates a locker writing claims into `lock_store` and validating values in
    /// `data_store`.
    ///
    /// The mediator is taken from `registry` under
    /// `"{local_mediator_group}:{lock_store.name()}"`.
    pub fn new(
        lock_store: Arc<dyn KeyColumnValueStore>,
        data_store: Arc<dyn KeyColumnValueStore>,
        registry: &MediatorRegistry<TxHandle>,
        options: LockerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let namespace = format!("{}:{}", options.local_mediator_group, lock_store.name());
        let mediator = registry.get(&namespace);
        Ok(Self {
            lock_store,
            data_store,
            rid: Rid::generate(),
            clock: registry.clock(),
            mediator,
            options,
            metrics: default_metrics(),
            next_tx: AtomicU64::new(1),
        })
    }

    /// Overrides the generated rid.
    pub fn with_rid(mut self, rid: Rid) -> Self {
        self.rid = rid;
        self
    }

    /// Sets the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn ConsistencyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Identifier written into this locker's claims.
    pub fn rid(&self) -> &Rid {
        &self.rid
    }

    /// Starts tracking locks for a new transaction.
    pub fn transaction(&self) -> LockTransaction {
        LockTransaction {
            handle: TxHandle {
                rid: self.rid.clone(),
                seq: self.next_tx.fetch_add(1, Ordering::Relaxed),
            },
            state: LockerState::default(),
        }
    }

    /// Takes the local hold for `claim` and writes a claim column for it.
    ///
    /// Re-requesting a lock this transaction already wrote is a no-op.
    pub fn write_lock(&self, claim: LockClaim, tx: &mut LockTransaction) -> Result<()> {
        self.metrics.lock_call("write");
        let kc = claim.target().clone();
        if tx.state.has(&kc) {
            trace!(%kc, tx = ?tx.handle, "locker.write.already_held");
            return Ok(());
        }

        let tentative = self.clock.now().plus(self.options.lock_expire);
        if !self.mediator.lock(&kc, &tx.handle, tentative) {
            self.metrics.lock_exception("write");
            debug!(%kc, tx = ?tx.handle, "locker.write.local_contention");
            return Err(UmbralError::PermanentLocking(format!(
                "lock {kc} is held by another local transaction"
            )));
        }

        match self.write_single_lock(&claim) {
            Ok(write_timestamp) => {
                let expire_timestamp = write_timestamp.plus(self.options.lock_expire);
                if !self.mediator.lock(&kc, &tx.handle, expire_timestamp) {
                    // Verification still decides the winner.
                    warn!(%kc, tx = ?tx.handle, "locker.write.local_refresh_lost");
                }
                debug!(%kc, tx = ?tx.handle, ts = %write_timestamp, "locker.write.ok");
                tx.state.insert(
                    kc,
                    LockStatus {
                        write_timestamp,
                        expire_timestamp,
                        checked: false,
                        claim,
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.mediator.unlock(&kc, &tx.handle);
                self.metrics.lock_exception("write");
                Err(err)
            }
        }
    }

    /// Writes the claim column, retrying writes slower than `lock_wait`.
    ///
    /// Columns from earlier attempts stay pending until a mutation that
    /// deletes them succeeds; whatever is still pending when the write gives
    /// up is deleted once on the way out.
    fn write_single_lock(&self, claim: &LockClaim) -> Result<Timestamp> {
        let lock_key = claim.lock_key();
        let mut pending: Vec<Bytes> = Vec::new();
        for attempt in 1..=self.options.lock_retry_count {
            let started = self.clock.now();
            let column = lock_column(started, &self.rid);
            let deletions: Vec<Bytes> = pending.iter().filter(|c| **c != column).cloned().collect();
            let outcome = self.lock_store.mutate(
                lock_key,
                &[Entry::new(column.clone(), Bytes::new())],
                &deletions,
            );
            let took = self.clock.now().duration_since(started);
            match outcome {
                Ok(()) if took <= self.options.lock_wait => return Ok(started),
                Ok(()) => {
                    pending.clear();
                    warn!(
                        kc = %claim.target(),
                        attempt,
                        ?took,
                        limit = ?self.options.lock_wait,
                        "locker.write.slow"
                    );
                }
                Err(err) if err.is_temporary() => {
                    warn!(kc = %claim.target(), attempt, error = %err, "locker.write.temporary_failure");
                }
                Err(err) => {
                    pending.push(column);
                    self.delete_claims_once(lock_key, &pending);
                    return Err(UmbralError::PermanentLocking(format!(
                        "writing claim for {} failed: {err}",
                        claim.target()
                    )));
                }
            }
            // A failed mutation may still have landed.
            if !pending.contains(&column) {
                pending.push(column);
            }
        }
        self.delete_claims_once(lock_key, &pending);
        Err(UmbralError::TemporaryLocking(format!(
            "claim write for {} exceeded {} attempts",
            claim.target(),
            self.options.lock_retry_count
        )))
    }

    /// Verifies seniority and expected values for every unchecked lock of `tx`.
    ///
    /// Blocks until the settle period of each claim has passed.
    pub fn check_locks(&self, tx: &mut LockTransaction) -> Result<()> {
        self.metrics.lock_call("check");
        for (kc, status) in tx.state.iter_mut() {
            if status.checked {
                continue;
            }
            if let Err(err) = self.check_single_lock(kc, status) {
                self.metrics.lock_exception("check");
                debug!(%kc, tx = ?tx.handle, error = %err, "locker.check.failed");
                return Err(err);
            }
        }
        Ok(())
    }

    fn check_single_lock(&self, kc: &KeyColumn, status: &mut LockStatus) -> Result<()> {
        let now = self
            .clock
            .sleep_past(status.write_timestamp.plus(self.options.lock_wait));
        let lock_key = status.claim.lock_key().clone();
        let cutoff = now.minus(self.options.lock_expire);

        let mut live = Vec::new();
        let mut saw_expired = false;
        for entry in self.read_claims(kc, &lock_key)? {
            let claim = match TimestampRid::parse(&entry.column) {
                Ok(claim) => claim,
                Err(err) => {
                    warn!(%kc, error = %err, "locker.check.malformed_claim");
                    continue;
                }
            };
            if claim.timestamp < cutoff {
                if claim.rid == self.rid && claim.timestamp == status.write_timestamp {
                    return Err(UmbralError::PermanentLocking(format!(
                        "lock {kc} expired before it was verified"
                    )));
                }
                saw_expired = true;
                continue;
            }
            live.push(claim);
        }
        if saw_expired && self.options.clean_expired {
            self.clean_expired(kc, &lock_key, cutoff);
        }

        live.sort();
        let mut outdated_own = false;
        let mut senior = false;
        for claim in &live {
            if claim.rid != self.rid {
                return Err(UmbralError::PermanentLocking(format!(
                    "lock {kc} is held by remote transaction {}",
                    claim.rid
                )));
            }
            if claim.timestamp == status.write_timestamp {
                senior = true;
                break;
            }
            warn!(%kc, ts = %claim.timestamp, "locker.check.outdated_own_claim");
            outdated_own = true;
        }
        if !senior {
            return Err(if outdated_own {
                UmbralError::PermanentLocking(format!(
                    "only outdated claims of this locker found for {kc}"
                ))
            } else {
                UmbralError::TemporaryLocking(format!("no claim found for {kc}"))
            });
        }

        let target = status.claim.target();
        let actual = self.read_value(target)?;
        if actual.as_ref() != status.claim.expected() {
            return Err(UmbralError::PermanentLocking(format!(
                "value at {target} changed since it was read"
            )));
        }
        status.checked = true;
        trace!(%kc, "locker.check.ok");
        Ok(())
    }

    fn read_claims(&self, kc: &KeyColumn, lock_key: &Bytes) -> Result<Vec<Entry>> {
        for attempt in 1..=self.options.lock_retry_count {
            match self.lock_store.get_slice(lock_key, &[], &[]) {
                Ok(entries) => return Ok(entries),
                Err(err) if err.is_temporary() => {
                    warn!(%kc, attempt, error = %err, "locker.check.read_retry");
                }
                Err(err) => {
                    return Err(UmbralError::PermanentLocking(format!(
                        "reading claims for {kc} failed: {err}"
                    )))
                }
            }
        }
        Err(UmbralError::TemporaryLocking(format!(
            "reading claims for {kc} exceeded {} attempts",
            self.options.lock_retry_count
        )))
    }

    fn read_value(&self, target: &KeyColumn) -> Result<Option<Bytes>> {
        for attempt in 1..=self.options.lock_retry_count {
            match self.data_store.get(target.key(), target.column()) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_temporary() => {
                    warn!(kc = %target, attempt, error = %err, "locker.check.value_read_retry");
                }
                Err(err) => {
                    return Err(UmbralError::PermanentLocking(format!(
                        "reading {target} failed: {err}"
                    )))
                }
            }
        }
        Err(UmbralError::TemporaryLocking(format!(
            "reading {target} exceeded {} attempts",
            self.options.lock_retry_count
        )))
    }

    fn clean_expired(&self, kc: &KeyColumn, lock_key: &Bytes, cutoff: Timestamp) {
        let end = cutoff.as_nanos().to_be_bytes();
        let stale = match self.lock_store.get_slice(lock_key, &[], &end) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%kc, error = %err, "locker.clean.read_failed");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }
        let columns: Vec<Bytes> = stale.into_iter().map(|e| e.column).collect();
        match self.lock_store.mutate(lock_key, &[], &columns) {
            Ok(()) => debug!(%kc, removed = columns.len(), "locker.clean.expired_claims"),
            Err(err) => warn!(%kc, error = %err, "locker.clean.delete_failed"),
        }
    }

    /// Deletes every claim of `tx` and releases its local holds.
    ///
    /// A claim that cannot be deleted is logged and left to expire; the local
    /// hold is released regardless.
    pub fn delete_locks(&self, tx: &mut LockTransaction) {
        self.metrics.lock_call("delete");
        for (kc, status) in tx.state.take_all() {
            let column = lock_column(status.write_timestamp, &self.rid);
            if let Err(err) = self.delete_claim(status.claim.lock_key(), &column) {
                self.metrics.lock_exception("delete");
                error!(%kc, tx = ?tx.handle, error = %err, "locker.delete.failed");
            }
            self.mediator.unlock(&kc, &tx.handle);
        }
    }

    fn delete_claim(&self, lock_key: &Bytes, column: &Bytes) -> Result<()> {
        let deletions = [column.clone()];
        let mut last = None;
        for attempt in 1..=self.options.lock_retry_count {
            match self.lock_store.mutate(lock_key, &[], &deletions) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_temporary() => {
                    warn!(attempt, error = %err, "locker.delete.retry");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            UmbralError::TemporaryBackend("claim delete was not attempted".into())
        }))
    }

    fn delete_claims_once(&self, lock_key: &Bytes, columns: &[Bytes]) {
        if columns.is_empty() {
            return;
        }
        if let Err(err) = self.lock_store.mutate(lock_key, &[], columns) {
            warn!(error = %err, abandoned = columns.len(), "locker.delete.abandoned_claim_failed");
        }
    }
}
