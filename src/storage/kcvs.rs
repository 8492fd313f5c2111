use std::fmt;

use bytes::Bytes;

use crate::primitives::bytes::ord;
use crate::types::Result;

/// A single column/value pair read from or written to a store row.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Column name; rows are ordered by this byte string.
    pub column: Bytes,
    /// Cell value.
    pub value: Bytes,
}

impl Entry {
    /// Builds an entry from anything convertible into [`Bytes`].
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entry({} => {})",
            hex::encode(&self.column),
            hex::encode(&self.value)
        )
    }
}

/// Ordered key-column-value store.
///
/// Errors are classified through [`crate::types::UmbralError::is_temporary`]:
/// backends report transient conditions as `TemporaryBackend` and everything
/// else as `PermanentBackend`.
pub trait KeyColumnValueStore: Send + Sync {
    /// Human-readable store name used in logs.
    fn name(&self) -> &str;

    /// Applies `additions` and `deletions` to the row at `key` as one mutation.
    ///
    /// Deletions are applied before additions, so a column present in both ends
    /// up written.
    fn mutate(&self, key: &[u8], additions: &[Entry], deletions: &[Bytes]) -> Result<()>;

    /// Returns columns in `[start, end)` of row `key` in ascending column order.
    ///
    /// An empty `end` means the slice is unbounded above.
    fn get_slice(&self, key: &[u8], start: &[u8], end: &[u8]) -> Result<Vec<Entry>>;

    /// Reads a single cell.
    fn get(&self, key: &[u8], column: &[u8]) -> Result<Option<Bytes>> {
        let end = ord::next_bigger(column).unwrap_or_default();
        let slice = self.get_slice(key, column, &end)?;
        Ok(slice
            .into_iter()
            .find(|e| e.column.as_ref() == column)
            .map(|e| e.value))
    }
}
