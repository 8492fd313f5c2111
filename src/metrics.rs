use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for locking and recovery counters.
///
/// Lock operations report an `op` of `"write"`, `"check"`, or `"delete"`.
pub trait ConsistencyMetrics: Send + Sync {
    /// Records an invocation of a locker operation.
    fn lock_call(&self, op: &'static str);

    /// Records a locker operation that ended in an error.
    fn lock_exception(&self, op: &'static str);

    /// Records a transaction whose secondary effects were confirmed in time.
    fn tx_confirmed(&self);

    /// Records a transaction handed to the repair pipeline.
    fn tx_failed(&self);

    /// Records a repair that finished without error.
    fn repair_completed(&self);

    /// Records a repair that gave up.
    fn repair_failed(&self);

    /// Records a change-log message dropped after exhausting its retries.
    fn change_dropped(&self);
}

/// A no-op implementation of [`ConsistencyMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl ConsistencyMetrics for NoopMetrics {
    fn lock_call(&self, _op: &'static str) {}
    fn lock_exception(&self, _op: &'static str) {}
    fn tx_confirmed(&self) {}
    fn tx_failed(&self) {}
    fn repair_completed(&self) {}
    fn repair_failed(&self) {}
    fn change_dropped(&self) {}
}

/// Atomic counters for every [`ConsistencyMetrics`] event.
#[derive(Default)]
pub struct CounterMetrics {
    /// `write_lock` invocations.
    pub lock_writes: AtomicU64,
    /// `check_locks` invocations.
    pub lock_checks: AtomicU64,
    /// `delete_locks` invocations.
    pub lock_deletes: AtomicU64,
    /// Failed `write_lock` calls.
    pub lock_write_errors: AtomicU64,
    /// Failed `check_locks` calls.
    pub lock_check_errors: AtomicU64,
    /// Claims that could not be deleted.
    pub lock_delete_errors: AtomicU64,
    /// Transactions confirmed before expiry.
    pub txs_confirmed: AtomicU64,
    /// Transactions sent to repair.
    pub txs_failed: AtomicU64,
    /// Successful repairs.
    pub repairs_completed: AtomicU64,
    /// Abandoned repairs.
    pub repairs_failed: AtomicU64,
    /// Dropped change-log messages.
    pub changes_dropped: AtomicU64,
}

impl CounterMetrics {
    /// Reads a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl ConsistencyMetrics for CounterMetrics {
    fn lock_call(&self, op: &'static str) {
        match op {
            "write" => {
                self.lock_writes.fetch_add(1, Ordering::Relaxed);
            }
            "check" => {
                self.lock_checks.fetch_add(1, Ordering::Relaxed);
            }
            "delete" => {
                self.lock_deletes.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn lock_exception(&self, op: &'static str) {
        match op {
            "write" => {
                self.lock_write_errors.fetch_add(1, Ordering::Relaxed);
            }
            "check" => {
                self.lock_check_errors.fetch_add(1, Ordering::Relaxed);
            }
            "delete" => {
                self.lock_delete_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn tx_confirmed(&self) {
        self.txs_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    fn tx_failed(&self) {
        self.txs_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn repair_completed(&self) {
        self.repairs_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn repair_failed(&self) {
        self.repairs_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn change_dropped(&self) {
        self.changes_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, a shared [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn ConsistencyMetrics> {
    Arc::new(NoopMetrics)
}
