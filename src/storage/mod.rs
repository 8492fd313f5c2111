//! Ordered key-column-value storage contract.
//!
//! The locking subsystem writes claims through [`KeyColumnValueStore`] and reads
//! the guarded cells back from it. Backends only need ordered column slices per
//! key; [`InMemoryStore`] is the reference implementation used by tests.

mod kcvs;
mod memory;

pub use kcvs::{Entry, KeyColumnValueStore};
pub use memory::{Fault, InMemoryStore};
