use std::fmt;

use bytes::Bytes;

/// A lockable cell: row key plus column.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyColumn {
    key: Bytes,
    column: Bytes,
}

impl KeyColumn {
    /// Creates a coordinate.
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }

    /// Row key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Column within the row.
    pub fn column(&self) -> &Bytes {
        &self.column
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(&self.key), hex::encode(&self.column))
    }
}

impl fmt::Debug for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyColumn({self})")
    }
}
