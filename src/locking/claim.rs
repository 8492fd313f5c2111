use bytes::{BufMut, Bytes, BytesMut};

use super::key_column::KeyColumn;
use crate::primitives::bytes::{buf::Reader, ord};
use crate::types::{Result, Rid, Timestamp, UmbralError};

/// A request to lock one cell of a store.
///
/// `expected` is the value the caller read before asking for the lock; `None`
/// means the cell was absent. Verification fails if the cell no longer matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockClaim {
    target: KeyColumn,
    expected: Option<Bytes>,
    lock_key: Bytes,
}

impl LockClaim {
    /// Creates a claim for `(key, column)`.
    ///
    /// The store is implied by the locker the claim is handed to.
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>, expected: Option<Bytes>) -> Self {
        let target = KeyColumn::new(key, column);
        let lock_key = lock_key(target.key(), target.column());
        Self {
            target,
            expected,
            lock_key,
        }
    }

    /// The guarded cell.
    pub fn target(&self) -> &KeyColumn {
        &self.target
    }

    /// Value expected at the guarded cell.
    pub fn expected(&self) -> Option<&Bytes> {
        self.expected.as_ref()
    }

    /// Row in the lock store holding claim columns for this cell.
    pub fn lock_key(&self) -> &Bytes {
        &self.lock_key
    }
}

/// `len(key)` as 4 big-endian bytes, then `key`, then `column`.
fn lock_key(key: &[u8], column: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + key.len() + column.len());
    ord::put_len_prefixed(&mut out, key);
    out.put_slice(column);
    out.freeze()
}

/// Claim column: 8-byte big-endian timestamp followed by the rid.
///
/// Byte order of these columns equals `(timestamp, rid)` order.
pub fn lock_column(ts: Timestamp, rid: &Rid) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + rid.as_bytes().len());
    ord::put_u64_be(&mut out, ts.as_nanos());
    out.put_slice(rid.as_bytes());
    out.freeze()
}

/// A decoded claim column.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampRid {
    /// Time the claim was written.
    pub timestamp: Timestamp,
    /// Author of the claim.
    pub rid: Rid,
}

impl TimestampRid {
    /// Decodes a column written by [`lock_column`].
    pub fn parse(column: &Bytes) -> Result<Self> {
        if column.len() < 8 {
            return Err(UmbralError::Corruption(format!(
                "lock column too short: {} bytes",
                column.len()
            )));
        }
        let mut reader = Reader::new(column.clone());
        let timestamp = Timestamp(reader.u64()?);
        let rid = Rid::new(reader.take_rest());
        Ok(Self { timestamp, rid })
    }
}
