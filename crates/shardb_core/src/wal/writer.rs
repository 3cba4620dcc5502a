//! Appending to and replaying the log.

use crate::error::{CoreError, CoreResult};
use crate::wal::iterator::WalIterator;
use crate::wal::record::{compute_digest, LogEntry};
use crate::wal::HEADER_SIZE;
use parking_lot::Mutex;
use shardb_storage::StorageBackend;
use std::sync::Arc;

/// What a full replay saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Number of intact records visited.
    pub records: usize,
    /// Offset just past the last intact record.
    pub valid_end: u64,
    /// Size of the log file.
    pub total_size: u64,
}

impl ReplaySummary {
    /// Whether a torn record follows the intact prefix.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_end < self.total_size
    }
}

/// The shard's write-ahead log.
///
/// Every record is `[length: u32 LE][digest: 16 bytes][payload]`.
pub struct WriteAhead {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
    sync_on_write: bool,
}

impl WriteAhead {
    /// Wraps a backend. With `sync_on_write` every record is fsynced before
    /// [`WriteAhead::log`] returns.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            sync_on_write,
        }
    }

    /// Appends an entry and returns the offset of its record.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded or the write fails.
    pub fn log(&self, entry: &LogEntry) -> CoreResult<u64> {
        let payload = entry.encode_payload()?;
        let length = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_format("log entry exceeds 4 GiB"))?;

        let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(&compute_digest(&payload));
        record.extend_from_slice(&payload);

        let mut backend = self.backend.lock();
        let offset = backend.append(&record)?;
        backend.flush()?;
        if self.sync_on_write {
            backend.sync()?;
        }

        Ok(offset)
    }

    /// Returns a streaming iterator over all records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn iter(&self) -> CoreResult<WalIterator<'_>> {
        WalIterator::new(self.backend.lock())
    }

    /// Visits every intact entry in file order.
    ///
    /// # Errors
    ///
    /// Returns the first digest, decode or I/O error, or the first error
    /// returned by `visitor`.
    pub fn replay<F>(&self, mut visitor: F) -> CoreResult<ReplaySummary>
    where
        F: FnMut(u64, LogEntry) -> CoreResult<()>,
    {
        let mut iter = self.iter()?;
        let mut records = 0;
        for item in iter.by_ref() {
            let (offset, entry) = item?;
            visitor(offset, entry)?;
            records += 1;
        }
        Ok(ReplaySummary {
            records,
            valid_end: iter.valid_end(),
            total_size: iter.total_size(),
        })
    }

    /// Cuts off a torn record so that new appends follow intact data.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    pub fn discard_torn_tail(&self, summary: &ReplaySummary) -> CoreResult<()> {
        if summary.has_torn_tail() {
            tracing::warn!(
                valid_end = summary.valid_end,
                size = summary.total_size,
                "discarding torn WAL tail"
            );
            self.backend.lock().truncate(summary.valid_end)?;
        }
        Ok(())
    }

    /// Returns the current log size.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    #[cfg(test)]
    pub(crate) fn backend_for_testing(&self) -> Arc<Mutex<Box<dyn StorageBackend>>> {
        Arc::clone(&self.backend)
    }
}

impl std::fmt::Debug for WriteAhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAhead")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationKind;
    use crate::types::{DocumentId, SequenceId, TransactionId};
    use crate::wal::{LogMutation, DIGEST_SIZE};
    use proptest::prelude::*;
    use shardb_storage::InMemoryBackend;

    fn create_wal() -> WriteAhead {
        WriteAhead::new(Box::new(InMemoryBackend::new()), false)
    }

    fn insert(doc: u64, body: &[u8]) -> LogMutation {
        LogMutation {
            kind: MutationKind::Insert,
            storage: "docs".into(),
            document_id: DocumentId::new(doc),
            buffer: body.to_vec(),
        }
    }

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::Submit {
                txid: TransactionId::new(1),
                mutations: vec![insert(1, b"a")],
            },
            LogEntry::SubmitCommit {
                txid: TransactionId::new(2),
                sequence_id: SequenceId::new(1),
                mutations: vec![insert(2, b"b"), insert(3, b"c")],
            },
            LogEntry::Commit {
                txid: TransactionId::new(1),
                sequence_id: SequenceId::new(2),
            },
            LogEntry::Rollback {
                txid: TransactionId::new(4),
            },
        ]
    }

    fn replay_all(wal: &WriteAhead) -> CoreResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        wal.replay(|_, entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    #[test]
    fn log_then_replay_in_order() {
        let wal = create_wal();
        let mut offsets = Vec::new();
        for entry in sample_entries() {
            offsets.push(wal.log(&entry).unwrap());
        }

        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(replay_all(&wal).unwrap(), sample_entries());
    }

    #[test]
    fn record_layout_has_length_and_digest_header() {
        let wal = create_wal();
        let entry = LogEntry::Rollback {
            txid: TransactionId::new(7),
        };
        wal.log(&entry).unwrap();

        let data = wal.backend_for_testing().lock().read_at(0, 20).unwrap();
        let payload = entry.encode_payload().unwrap();
        assert_eq!(&data[0..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&data[4..20], &compute_digest(&payload));
    }

    #[test]
    fn corrupted_payload_byte_is_fatal() {
        let wal = create_wal();
        for entry in sample_entries() {
            wal.log(&entry).unwrap();
        }

        let backend = wal.backend_for_testing();
        let data = backend.lock().read_at(0, 60).unwrap();
        // Flip the last byte of the first record's payload.
        let first_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64;
        let target = HEADER_SIZE as u64 + first_len - 1;
        let byte = backend.lock().read_at(target, 1).unwrap()[0];
        backend.lock().write_at(target, &[byte ^ 0xFF]).unwrap();

        assert!(matches!(
            replay_all(&wal),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn torn_tail_ends_replay_and_can_be_discarded() {
        let wal = create_wal();
        for entry in sample_entries() {
            wal.log(&entry).unwrap();
        }
        let intact = wal.size().unwrap();

        // A half-written record: header promises 100 bytes, 3 follow.
        let backend = wal.backend_for_testing();
        let mut torn = 100u32.to_le_bytes().to_vec();
        torn.extend_from_slice(&[0u8; DIGEST_SIZE + 3]);
        backend.lock().append(&torn).unwrap();

        let summary = wal.replay(|_, _| Ok(())).unwrap();
        assert_eq!(summary.records, 4);
        assert_eq!(summary.valid_end, intact);
        assert!(summary.has_torn_tail());

        wal.discard_torn_tail(&summary).unwrap();
        assert_eq!(wal.size().unwrap(), intact);

        wal.log(&LogEntry::Rollback {
            txid: TransactionId::new(9),
        })
        .unwrap();
        assert_eq!(replay_all(&wal).unwrap().len(), 5);
    }

    #[test]
    fn empty_log_replays_nothing() {
        let wal = create_wal();
        let summary = wal.replay(|_, _| Ok(())).unwrap();
        assert_eq!(summary.records, 0);
        assert!(!summary.has_torn_tail());
    }

    #[test]
    fn visitor_error_aborts_replay() {
        let wal = create_wal();
        for entry in sample_entries() {
            wal.log(&entry).unwrap();
        }
        let mut seen = 0;
        let result = wal.replay(|_, _| {
            seen += 1;
            if seen == 2 {
                Err(CoreError::invariant("stop"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen, 2);
    }

    fn arb_mutation() -> impl Strategy<Value = LogMutation> {
        (
            prop_oneof![Just(MutationKind::Insert), Just(MutationKind::Modify)],
            "[a-z]{1,8}",
            any::<u64>(),
            prop::collection::vec(any::<u8>(), 0..64),
        )
            .prop_map(|(kind, storage, doc, buffer)| LogMutation {
                kind,
                storage,
                document_id: DocumentId::new(doc),
                buffer,
            })
    }

    fn arb_mutations() -> impl Strategy<Value = Vec<LogMutation>> {
        prop::collection::vec(arb_mutation(), 0..4)
    }

    fn arb_entry() -> impl Strategy<Value = LogEntry> {
        let txid = any::<u64>().prop_map(TransactionId::new);
        let seq = any::<u64>().prop_map(SequenceId::new);
        prop_oneof![
            (txid.clone(), arb_mutations())
                .prop_map(|(txid, mutations)| LogEntry::Submit { txid, mutations }),
            (txid.clone(), seq.clone(), arb_mutations()).prop_map(|(txid, sequence_id, mutations)| {
                LogEntry::SubmitCommit {
                    txid,
                    sequence_id,
                    mutations,
                }
            }),
            (txid.clone(), seq).prop_map(|(txid, sequence_id)| LogEntry::Commit { txid, sequence_id }),
            txid.prop_map(|txid| LogEntry::Rollback { txid }),
        ]
    }

    proptest! {
        #[test]
        fn replay_reproduces_logged_entries(entries in prop::collection::vec(arb_entry(), 0..16)) {
            let wal = create_wal();
            for entry in &entries {
                wal.log(entry).unwrap();
            }
            prop_assert_eq!(replay_all(&wal).unwrap(), entries);
        }

        #[test]
        fn any_flipped_payload_byte_is_detected(
            entries in prop::collection::vec(arb_entry(), 1..6),
            pick in any::<prop::sample::Index>(),
        ) {
            let wal = create_wal();
            let mut spans = Vec::new();
            for entry in &entries {
                let offset = wal.log(entry).unwrap();
                let len = entry.encode_payload().unwrap().len() as u64;
                spans.push((offset + HEADER_SIZE as u64, len));
            }
            let payload_bytes: Vec<u64> = spans
                .iter()
                .flat_map(|&(start, len)| start..start + len)
                .collect();
            let target = payload_bytes[pick.index(payload_bytes.len())];

            let backend = wal.backend_for_testing();
            let byte = backend.lock().read_at(target, 1).unwrap()[0];
            backend.lock().write_at(target, &[byte ^ 0x5A]).unwrap();

            let corrupted = matches!(replay_all(&wal), Err(CoreError::WalCorruption { .. }));
            prop_assert!(corrupted, "flipped byte at {} was not detected", target);
        }
    }
}
