//! Cluster-wide discretionary locking over a key-column-value store.
//!
//! A lock request first passes the in-process [`LocalLockMediator`], then writes
//! a timestamped claim column next to the guarded cell. After a settle period
//! the claims are read back and the oldest valid one wins; the winner also
//! re-reads the guarded cell and compares it with the value it expected.

mod claim;
mod key_column;
mod locker;
mod mediator;
mod state;

pub use claim::{lock_column, LockClaim, TimestampRid};
pub use key_column::KeyColumn;
pub use locker::{ConsistentKeyLocker, LockTransaction, TxHandle};
pub use mediator::{LocalLockMediator, MediatorRegistry};
pub use state::{LockStatus, LockerState};
