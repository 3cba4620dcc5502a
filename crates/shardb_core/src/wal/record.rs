//! Log entries and their payload encoding.

use crate::error::{CoreError, CoreResult};
use crate::mutation::MutationKind;
use crate::types::{DocumentId, SequenceId, TransactionId};
use sha2::{Digest, Sha256};

/// Size of the content digest stored in every record header.
pub const DIGEST_SIZE: usize = 16;

/// Computes the record digest: the first 16 bytes of SHA-256 over `payload`.
#[must_use]
pub fn compute_digest(payload: &[u8]) -> [u8; DIGEST_SIZE] {
    let full = Sha256::digest(payload);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&full[..DIGEST_SIZE]);
    digest
}

/// Type tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEntryType {
    /// A transaction passed its submit checks.
    Submit = 1,
    /// A transaction was submitted and committed in one coordinator pass.
    SubmitCommit = 2,
    /// A previously submitted transaction was committed.
    Commit = 3,
    /// A previously submitted transaction was rolled back.
    Rollback = 4,
}

impl LogEntryType {
    /// Converts a byte to an entry type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Submit),
            2 => Some(Self::SubmitCommit),
            3 => Some(Self::Commit),
            4 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Converts the entry type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A mutation as it is written to the log.
///
/// Storages are referenced by identifier, since slot numbers are not stable
/// across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMutation {
    /// Insert or modify.
    pub kind: MutationKind,
    /// Identifier of the target storage.
    pub storage: String,
    /// Target document.
    pub document_id: DocumentId,
    /// Document contents.
    pub buffer: Vec<u8>,
}

/// One structured entry of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Submitted, awaiting commit or rollback.
    Submit {
        /// Transaction ID.
        txid: TransactionId,
        /// The transaction's mutations.
        mutations: Vec<LogMutation>,
    },
    /// Submitted and committed at once.
    SubmitCommit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence id assigned to the commit.
        sequence_id: SequenceId,
        /// The transaction's mutations.
        mutations: Vec<LogMutation>,
    },
    /// Commit of an earlier `Submit`.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence id assigned to the commit.
        sequence_id: SequenceId,
    },
    /// Rollback of an earlier `Submit`.
    Rollback {
        /// Transaction ID.
        txid: TransactionId,
    },
}

const HAS_SEQUENCE: u8 = 0b01;
const HAS_MUTATIONS: u8 = 0b10;

impl LogEntry {
    /// Returns the entry type.
    #[must_use]
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            Self::Submit { .. } => LogEntryType::Submit,
            Self::SubmitCommit { .. } => LogEntryType::SubmitCommit,
            Self::Commit { .. } => LogEntryType::Commit,
            Self::Rollback { .. } => LogEntryType::Rollback,
        }
    }

    /// Returns the transaction this entry belongs to.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Submit { txid, .. }
            | Self::SubmitCommit { txid, .. }
            | Self::Commit { txid, .. }
            | Self::Rollback { txid } => *txid,
        }
    }

    /// Returns the sequence id, if the entry carries one.
    #[must_use]
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            Self::SubmitCommit { sequence_id, .. } | Self::Commit { sequence_id, .. } => {
                Some(*sequence_id)
            }
            _ => None,
        }
    }

    /// Returns the mutation list, if the entry carries one.
    #[must_use]
    pub fn mutations(&self) -> Option<&[LogMutation]> {
        match self {
            Self::Submit { mutations, .. } | Self::SubmitCommit { mutations, .. } => {
                Some(mutations)
            }
            _ => None,
        }
    }

    /// Serializes the entry (without the length and digest envelope).
    ///
    /// ```text
    /// | type (1) | txid (8) | flags (1) | [seq (8)] | [count (4) | mutation*] |
    /// mutation = | kind (1) | name_len (2) | name | doc (8) | buf_len (4) | buf |
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if a storage identifier or document buffer exceeds
    /// its length field.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.push(self.entry_type().as_byte());
        buf.extend_from_slice(&self.txid().as_u64().to_le_bytes());

        let sequence_id = self.sequence_id();
        let mutations = self.mutations();
        let mut flags = 0u8;
        if sequence_id.is_some() {
            flags |= HAS_SEQUENCE;
        }
        if mutations.is_some() {
            flags |= HAS_MUTATIONS;
        }
        buf.push(flags);

        if let Some(seq) = sequence_id {
            buf.extend_from_slice(&seq.as_u64().to_le_bytes());
        }

        if let Some(mutations) = mutations {
            let count = u32::try_from(mutations.len())
                .map_err(|_| CoreError::invalid_format("too many mutations in one entry"))?;
            buf.extend_from_slice(&count.to_le_bytes());

            for mutation in mutations {
                buf.push(mutation.kind.as_byte());

                let name = mutation.storage.as_bytes();
                let name_len = u16::try_from(name.len()).map_err(|_| {
                    CoreError::invalid_format(format!(
                        "storage identifier of {} bytes is too long",
                        name.len()
                    ))
                })?;
                buf.extend_from_slice(&name_len.to_le_bytes());
                buf.extend_from_slice(name);

                buf.extend_from_slice(&mutation.document_id.as_u64().to_le_bytes());

                let buf_len = u32::try_from(mutation.buffer.len()).map_err(|_| {
                    CoreError::invalid_format(format!(
                        "document of {} bytes exceeds the record limit",
                        mutation.buffer.len()
                    ))
                })?;
                buf.extend_from_slice(&buf_len.to_le_bytes());
                buf.extend_from_slice(&mutation.buffer);
            }
        }

        Ok(buf)
    }

    /// Deserializes an entry from its payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] if the payload is truncated, has
    /// trailing bytes, or carries fields that do not match its type.
    pub fn decode_payload(data: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader { data, pos: 0 };

        let type_byte = reader.u8()?;
        let entry_type = LogEntryType::from_byte(type_byte).ok_or_else(|| {
            CoreError::wal_corruption(format!("unknown log entry type {type_byte}"))
        })?;
        let txid = TransactionId::new(reader.u64()?);
        let flags = reader.u8()?;

        let sequence_id = if flags & HAS_SEQUENCE != 0 {
            Some(SequenceId::new(reader.u64()?))
        } else {
            None
        };

        let mutations = if flags & HAS_MUTATIONS != 0 {
            let count = reader.u32()? as usize;
            let mut mutations = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let kind_byte = reader.u8()?;
                let kind = MutationKind::from_byte(kind_byte).ok_or_else(|| {
                    CoreError::wal_corruption(format!("unknown mutation kind {kind_byte}"))
                })?;
                let name_len = reader.u16()? as usize;
                let storage = String::from_utf8(reader.take(name_len)?.to_vec())
                    .map_err(|_| CoreError::wal_corruption("storage identifier is not UTF-8"))?;
                let document_id = DocumentId::new(reader.u64()?);
                let buf_len = reader.u32()? as usize;
                let buffer = reader.take(buf_len)?.to_vec();
                mutations.push(LogMutation {
                    kind,
                    storage,
                    document_id,
                    buffer,
                });
            }
            Some(mutations)
        } else {
            None
        };

        if reader.remaining() != 0 {
            return Err(CoreError::wal_corruption(format!(
                "{} trailing bytes after log entry",
                reader.remaining()
            )));
        }

        let mismatch =
            || CoreError::wal_corruption(format!("fields do not match {entry_type:?} entry"));
        match (entry_type, sequence_id, mutations) {
            (LogEntryType::Submit, None, Some(mutations)) => Ok(Self::Submit { txid, mutations }),
            (LogEntryType::SubmitCommit, Some(sequence_id), Some(mutations)) => {
                Ok(Self::SubmitCommit {
                    txid,
                    sequence_id,
                    mutations,
                })
            }
            (LogEntryType::Commit, Some(sequence_id), None) => {
                Ok(Self::Commit { txid, sequence_id })
            }
            (LogEntryType::Rollback, None, None) => Ok(Self::Rollback { txid }),
            _ => Err(mismatch()),
        }
    }
}

/// Bounds-checked little-endian reader over a payload.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CoreError::wal_corruption("log entry payload truncated"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }
}
