use std::collections::BTreeSet;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::primitives::bytes::{buf::Reader, ord, var};
use crate::types::{Result, Timestamp, TransactionId, UmbralError};

/// Commit progress recorded on the transaction log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogTxStatus {
    /// Modifications about to be persisted.
    Precommit = 0,
    /// The primary store write succeeded.
    PrimarySuccess = 1,
    /// Primary write succeeded and no secondary effects were pending.
    CompleteSuccess = 2,
    /// All secondary effects were confirmed.
    SecondarySuccess = 3,
    /// At least one secondary effect failed.
    SecondaryFailure = 4,
    /// Copy of a commit written to a user log.
    UserLog = 5,
}

impl LogTxStatus {
    /// Decodes a status byte.
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => LogTxStatus::Precommit,
            1 => LogTxStatus::PrimarySuccess,
            2 => LogTxStatus::CompleteSuccess,
            3 => LogTxStatus::SecondarySuccess,
            4 => LogTxStatus::SecondaryFailure,
            5 => LogTxStatus::UserLog,
            other => {
                return Err(UmbralError::Corruption(format!(
                    "unknown transaction status {other}"
                )))
            }
        })
    }

    /// Whether the primary write is known to have succeeded.
    pub fn is_primary_success(self) -> bool {
        matches!(self, LogTxStatus::PrimarySuccess | LogTxStatus::CompleteSuccess)
    }

    /// Whether the status settles the outcome of secondary effects.
    pub fn is_secondary(self) -> bool {
        matches!(
            self,
            LogTxStatus::SecondarySuccess | LogTxStatus::SecondaryFailure
        )
    }
}

/// Optional metadata attached to a log record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogTxMetadata {
    /// User log that should receive a copy of the commit.
    pub log_id: Option<String>,
    /// Transaction group for instrumentation.
    pub group_name: Option<String>,
    /// Original transaction of a user-log copy.
    pub source_transaction: Option<TransactionId>,
}

const META_LOG_ID: u8 = 0;
const META_GROUP_NAME: u8 = 1;
const META_SOURCE_TRANSACTION: u8 = 2;

impl LogTxMetadata {
    fn len(&self) -> usize {
        usize::from(self.log_id.is_some())
            + usize::from(self.group_name.is_some())
            + usize::from(self.source_transaction.is_some())
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.len() as u8);
        if let Some(log_id) = &self.log_id {
            out.put_u8(META_LOG_ID);
            ord::put_len_prefixed(out, log_id.as_bytes());
        }
        if let Some(group) = &self.group_name {
            out.put_u8(META_GROUP_NAME);
            ord::put_len_prefixed(out, group.as_bytes());
        }
        if let Some(source) = &self.source_transaction {
            out.put_u8(META_SOURCE_TRANSACTION);
            ord::put_len_prefixed(out, source.sender_id.as_bytes());
            var::encode_u64(source.tx_id, out);
            ord::put_u64_be(out, source.timestamp.as_nanos());
        }
    }

    fn decode(reader: &mut Reader) -> Result<Self> {
        let mut meta = LogTxMetadata::default();
        let count = reader.u8()?;
        for _ in 0..count {
            match reader.u8()? {
                META_LOG_ID => meta.log_id = Some(reader.string()?),
                META_GROUP_NAME => meta.group_name = Some(reader.string()?),
                META_SOURCE_TRANSACTION => {
                    let sender = reader.string()?;
                    let tx_id = reader.varint()?;
                    let ts = Timestamp(reader.u64()?);
                    meta.source_transaction = Some(TransactionId::new(sender, tx_id, ts));
                }
                other => {
                    return Err(UmbralError::Corruption(format!(
                        "unknown log metadata tag {other}"
                    )))
                }
            }
        }
        Ok(meta)
    }
}

/// Direction of a logged relation change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Change {
    /// The relation was created.
    Added,
    /// The relation was deleted.
    Removed,
}

/// One changed relation as written to the log.
#[derive(Clone, PartialEq, Eq)]
pub struct Modification {
    /// Whether the relation was added or removed.
    pub change: Change,
    /// Vertex the relation cell is stored under.
    pub out_vertex_id: u64,
    /// Serialized relation as stored in the primary store.
    pub relation_cell: Bytes,
}

impl Modification {
    /// Creates a modification record.
    pub fn new(change: Change, out_vertex_id: u64, relation_cell: impl Into<Bytes>) -> Self {
        Self {
            change,
            out_vertex_id,
            relation_cell: relation_cell.into(),
        }
    }
}

impl fmt::Debug for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(v{} {})",
            self.change,
            self.out_vertex_id,
            hex::encode(&self.relation_cell)
        )
    }
}

/// Payload of a `SecondaryFailure` record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecondaryFailures {
    /// Delivery to the user log failed.
    pub user_log_failure: bool,
    /// Names of mixed indexes whose update failed.
    pub failed_indexes: BTreeSet<String>,
}

/// Identity of one transaction's records: per-sender id plus commit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionLogHeader {
    tx_id: u64,
    timestamp: Timestamp,
}

impl TransactionLogHeader {
    /// Creates a header; transaction ids start at 1.
    pub fn new(tx_id: u64, timestamp: Timestamp) -> Result<Self> {
        if tx_id == 0 {
            return Err(UmbralError::Invalid("transaction id must be positive".into()));
        }
        Ok(Self { tx_id, timestamp })
    }

    /// Per-sender transaction counter value.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Commit timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Full identity of this transaction as written by `sender_id`.
    pub fn transaction_id(&self, sender_id: &str) -> TransactionId {
        TransactionId::new(sender_id, self.tx_id, self.timestamp)
    }

    fn begin(&self, status: LogTxStatus, meta: &LogTxMetadata, capacity: usize) -> BytesMut {
        let mut out = BytesMut::with_capacity(32 + capacity);
        out.put_u8(status as u8);
        var::encode_u64(self.tx_id, &mut out);
        ord::put_u64_be(&mut out, self.timestamp.as_nanos());
        meta.encode(&mut out);
        out
    }

    /// Encodes a `Precommit` or `UserLog` record listing `modifications`.
    pub fn serialize_modifications(
        &self,
        status: LogTxStatus,
        meta: &LogTxMetadata,
        modifications: &[Modification],
    ) -> Result<Bytes> {
        if !matches!(status, LogTxStatus::Precommit | LogTxStatus::UserLog) {
            return Err(UmbralError::Invalid(format!(
                "{status:?} records carry no modifications"
            )));
        }
        let size: usize = modifications.iter().map(|m| 12 + m.relation_cell.len()).sum();
        let mut out = self.begin(status, meta, size);
        var::encode_u64(modifications.len() as u64, &mut out);
        for m in modifications {
            out.put_u8(match m.change {
                Change::Added => 0,
                Change::Removed => 1,
            });
            var::encode_u64(m.out_vertex_id, &mut out);
            ord::put_len_prefixed(&mut out, &m.relation_cell);
        }
        Ok(out.freeze())
    }

    /// Encodes a `PrimarySuccess` or `CompleteSuccess` record.
    pub fn serialize_primary(&self, status: LogTxStatus) -> Result<Bytes> {
        if !status.is_primary_success() {
            return Err(UmbralError::Invalid(format!(
                "{status:?} is not a primary outcome"
            )));
        }
        Ok(self.begin(status, &LogTxMetadata::default(), 0).freeze())
    }

    /// Encodes a `SecondarySuccess` record, or `SecondaryFailure` when
    /// `failures` is given.
    pub fn serialize_secondary(&self, failures: Option<&SecondaryFailures>) -> Bytes {
        let Some(failures) = failures else {
            return self
                .begin(LogTxStatus::SecondarySuccess, &LogTxMetadata::default(), 0)
                .freeze();
        };
        let mut out = self.begin(
            LogTxStatus::SecondaryFailure,
            &LogTxMetadata::default(),
            8 + failures.failed_indexes.len() * 16,
        );
        out.put_u8(u8::from(!failures.user_log_failure));
        var::encode_u64(failures.failed_indexes.len() as u64, &mut out);
        for index in &failures.failed_indexes {
            ord::put_len_prefixed(&mut out, index.as_bytes());
        }
        out.freeze()
    }

    /// Encodes a `UserLog` copy of `source`, a parsed `Precommit` record.
    ///
    /// The copy is stamped with `source_id` so readers can recognise redeliveries.
    pub fn serialize_user_log(&self, source: &LogEntry, source_id: &TransactionId) -> Result<Bytes> {
        if source.status != LogTxStatus::Precommit || source.header.tx_id != source_id.tx_id {
            return Err(UmbralError::Invalid(format!(
                "user log copy needs the precommit record of {source_id}"
            )));
        }
        if source.content.is_empty() {
            return Err(UmbralError::Invalid(format!(
                "precommit record of {source_id} has no content"
            )));
        }
        let meta = LogTxMetadata {
            source_transaction: Some(source_id.clone()),
            ..LogTxMetadata::default()
        };
        let mut out = self.begin(LogTxStatus::UserLog, &meta, source.content.len());
        out.put_slice(&source.content);
        Ok(out.freeze())
    }

    /// Decodes a record produced by one of the `serialize_*` methods.
    pub fn parse(buf: Bytes) -> Result<LogEntry> {
        let mut reader = Reader::new(buf);
        let status = LogTxStatus::from_byte(reader.u8()?)?;
        let tx_id = reader.varint()?;
        if tx_id == 0 {
            return Err(UmbralError::Corruption("transaction id 0 on log".into()));
        }
        let timestamp = Timestamp(reader.u64()?);
        let metadata = LogTxMetadata::decode(&mut reader)?;
        Ok(LogEntry {
            header: TransactionLogHeader { tx_id, timestamp },
            status,
            metadata,
            content: reader.take_rest(),
        })
    }
}

/// A decoded transaction log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Transaction the record belongs to.
    pub header: TransactionLogHeader,
    /// Commit progress announced by the record.
    pub status: LogTxStatus,
    /// Attached metadata.
    pub metadata: LogTxMetadata,
    /// Status-specific payload; empty when there is none.
    pub content: Bytes,
}

impl LogEntry {
    /// Whether the record carries a payload.
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Decodes the modification list of a `Precommit` or `UserLog` record.
    pub fn modifications(&self) -> Result<Vec<Modification>> {
        if !matches!(self.status, LogTxStatus::Precommit | LogTxStatus::UserLog) {
            return Err(UmbralError::Invalid(format!(
                "{:?} records carry no modifications",
                self.status
            )));
        }
        let mut reader = Reader::new(self.content.clone());
        let count = reader.varint()?;
        let mut out = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let change = match reader.u8()? {
                0 => Change::Added,
                1 => Change::Removed,
                other => {
                    return Err(UmbralError::Corruption(format!(
                        "unknown change kind {other}"
                    )))
                }
            };
            let out_vertex_id = reader.varint()?;
            let relation_cell = reader.len_prefixed()?;
            out.push(Modification {
                change,
                out_vertex_id,
                relation_cell,
            });
        }
        Ok(out)
    }

    /// Decodes the payload of a `SecondaryFailure` record.
    pub fn secondary_failures(&self) -> Result<SecondaryFailures> {
        if self.status != LogTxStatus::SecondaryFailure {
            return Err(UmbralError::Invalid(format!(
                "{:?} records carry no failure detail",
                self.status
            )));
        }
        let mut reader = Reader::new(self.content.clone());
        let user_log_success = reader.u8()? != 0;
        let count = reader.varint()?;
        let mut failed_indexes = BTreeSet::new();
        for _ in 0..count {
            failed_indexes.insert(reader.string()?);
        }
        Ok(SecondaryFailures {
            user_log_failure: !user_log_success,
            failed_indexes,
        })
    }
}
