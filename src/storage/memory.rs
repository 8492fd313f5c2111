use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::kcvs::{Entry, KeyColumnValueStore};
use crate::types::{Result, UmbralError};

/// One-shot failure queued on an [`InMemoryStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next `mutate` fails with a temporary error.
    TemporaryMutate,
    /// The next `mutate` fails with a permanent error.
    PermanentMutate,
    /// The next `get_slice` fails with a temporary error.
    TemporaryRead,
    /// The next `get_slice` fails with a permanent error.
    PermanentRead,
}

type Row = BTreeMap<Bytes, Bytes>;

/// Ordered in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    name: String,
    rows: RwLock<BTreeMap<Bytes, Row>>,
    faults: Mutex<VecDeque<Fault>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Queues a failure for an upcoming operation; faults fire in FIFO order per kind.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Number of columns currently stored at `key`.
    pub fn column_count(&self, key: &[u8]) -> usize {
        self.rows.read().get(key).map_or(0, BTreeMap::len)
    }

    fn take_fault(&self, reading: bool) -> Option<UmbralError> {
        let mut faults = self.faults.lock();
        let pos = faults.iter().position(|f| {
            matches!(
                (reading, f),
                (true, Fault::TemporaryRead | Fault::PermanentRead)
                    | (false, Fault::TemporaryMutate | Fault::PermanentMutate)
            )
        })?;
        let fault = faults.remove(pos)?;
        let msg = format!("injected {fault:?} on {}", self.name);
        Some(match fault {
            Fault::TemporaryMutate | Fault::TemporaryRead => UmbralError::TemporaryBackend(msg),
            Fault::PermanentMutate | Fault::PermanentRead => UmbralError::PermanentBackend(msg),
        })
    }
}

impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutate(&self, key: &[u8], additions: &[Entry], deletions: &[Bytes]) -> Result<()> {
        if let Some(err) = self.take_fault(false) {
            return Err(err);
        }
        let mut rows = self.rows.write();
        let row = rows.entry(Bytes::copy_from_slice(key)).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column.clone(), entry.value.clone());
        }
        if row.is_empty() {
            rows.remove(key);
        }
        trace!(
            store = %self.name,
            adds = additions.len(),
            dels = deletions.len(),
            "kcvs.mutate"
        );
        Ok(())
    }

    fn get_slice(&self, key: &[u8], start: &[u8], end: &[u8]) -> Result<Vec<Entry>> {
        if let Some(err) = self.take_fault(true) {
            return Err(err);
        }
        let rows = self.rows.read();
        let Some(row) = rows.get(key) else {
            return Ok(Vec::new());
        };
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        Ok(row
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(c, v)| Entry::new(c.clone(), v.clone()))
            .collect())
    }
}
