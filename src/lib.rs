//! Umbral: consistency and crash recovery for key-column-value graph storage.
//!
//! Two independent subsystems live here:
//!
//! - [`locking`]: discretionary cluster locks built from claims written to an
//!   ordered [`storage::KeyColumnValueStore`], with an in-process
//!   [`locking::LocalLockMediator`] resolving contention between threads before
//!   any store I/O.
//! - [`recovery`]: a [`recovery::TransactionLogProcessor`] tailing the system
//!   transaction log and repairing commits whose index writes or user-log
//!   deliveries were never confirmed.
//!
//! [`changelog`] replays user logs into registered change processors.
//! Backends are reached only through traits; [`storage::InMemoryStore`],
//! [`log::MemoryLogManager`], [`index::MemoryIndex`] and [`graph::MemoryGraph`]
//! implement them in memory.

#![warn(missing_docs)]

pub mod changelog;
pub mod config;
pub mod graph;
pub mod index;
pub mod locking;
pub mod log;
pub mod logging;
pub mod metrics;
pub mod primitives;
pub mod recovery;
pub mod storage;
pub mod types;

pub use config::{LockerOptions, RecoveryOptions, UmbralConfig};
pub use types::{Result, Rid, Timestamp, TransactionId, UmbralError};
