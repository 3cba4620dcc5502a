//! Recovery from the write-ahead log.
//!
//! The metadata pass rebuilds the transaction counter, the current sequence
//! id and the set of transactions still submitted. The data pass runs once
//! per driver and re-sequences every committed mutation list into it.

use crate::driver::Sequenceable;
use crate::engine::drivers::from_log;
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::types::{SequenceId, StorageIndex, TransactionId};
use crate::wal::{LogEntry, LogMutation, ReplaySummary, WriteAhead};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Transaction metadata rebuilt from the log.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    /// Next transaction id to hand out.
    pub next_transaction: u64,
    /// Sequence id of the last logged commit.
    pub sequence_id: SequenceId,
    /// Submitted without a later commit or rollback, in id order.
    pub submitted: BTreeMap<TransactionId, Vec<LogMutation>>,
    /// Extent of the intact log.
    pub summary: Option<ReplaySummary>,
}

fn advance(current: &mut SequenceId, next: SequenceId, offset: u64) -> CoreResult<()> {
    if next <= *current {
        return Err(CoreError::wal_corruption(format!(
            "{next} at offset {offset} does not follow {current}"
        )));
    }
    *current = next;
    Ok(())
}

/// First pass: rebuilds transaction metadata.
///
/// # Errors
///
/// Returns [`CoreError::WalCorruption`] for undecodable records, commits or
/// rollbacks without a preceding submit, and sequence ids that go backwards.
pub(crate) fn recover_metadata(wal: &WriteAhead) -> CoreResult<Recovered> {
    let mut recovered = Recovered {
        next_transaction: 1,
        ..Recovered::default()
    };

    let summary = wal.replay(|offset, entry| {
        recovered.next_transaction = recovered
            .next_transaction
            .max(entry.txid().as_u64().saturating_add(1));

        match entry {
            LogEntry::Submit { txid, mutations } => {
                if recovered.submitted.insert(txid, mutations).is_some() {
                    return Err(CoreError::wal_corruption(format!(
                        "{txid} submitted twice (offset {offset})"
                    )));
                }
            }
            LogEntry::SubmitCommit { sequence_id, .. } => {
                advance(&mut recovered.sequence_id, sequence_id, offset)?;
            }
            LogEntry::Commit { txid, sequence_id } => {
                if recovered.submitted.remove(&txid).is_none() {
                    return Err(CoreError::wal_corruption(format!(
                        "commit of {txid} without submit (offset {offset})"
                    )));
                }
                advance(&mut recovered.sequence_id, sequence_id, offset)?;
            }
            LogEntry::Rollback { txid } => {
                if recovered.submitted.remove(&txid).is_none() {
                    return Err(CoreError::wal_corruption(format!(
                        "rollback of {txid} without submit (offset {offset})"
                    )));
                }
            }
        }
        Ok(())
    })?;

    tracing::info!(
        records = summary.records,
        sequence_id = %recovered.sequence_id,
        submitted = recovered.submitted.len(),
        "recovered transaction metadata"
    );
    recovered.summary = Some(summary);
    Ok(recovered)
}

/// Translates a logged mutation list, skipping storages that no longer
/// exist.
pub(crate) fn translate(
    mutations: &[LogMutation],
    storages: &HashMap<String, StorageIndex>,
    missing: &mut HashSet<String>,
) -> Vec<Mutation> {
    mutations
        .iter()
        .filter_map(|logged| {
            let mutation = from_log(logged, storages);
            if mutation.is_none() && missing.insert(logged.storage.clone()) {
                tracing::warn!(
                    storage = %logged.storage,
                    "log names a storage that is not set up; skipping its mutations"
                );
            }
            mutation
        })
        .collect()
}

/// Second pass for one driver: reinspects every logged mutation and
/// re-sequences every committed mutation list, in log order.
///
/// Returns the number of commits applied.
///
/// # Errors
///
/// Returns the first log or driver error.
pub(crate) fn resequence<D>(
    wal: &WriteAhead,
    storages: &HashMap<String, StorageIndex>,
    driver: &D,
    label: &str,
) -> CoreResult<u64>
where
    D: Sequenceable + ?Sized,
{
    let mut pending: HashMap<TransactionId, Vec<Mutation>> = HashMap::new();
    let mut missing = HashSet::new();
    let mut commits = 0u64;

    let reinspect = |mutations: &[Mutation]| -> CoreResult<()> {
        for mutation in mutations {
            driver.reinspect(mutation)?;
        }
        Ok(())
    };

    wal.replay(|offset, entry| {
        match entry {
            LogEntry::Submit { txid, mutations } => {
                let mutations = translate(&mutations, storages, &mut missing);
                reinspect(&mutations)?;
                pending.insert(txid, mutations);
            }
            LogEntry::SubmitCommit {
                sequence_id,
                mutations,
                ..
            } => {
                let mutations = translate(&mutations, storages, &mut missing);
                reinspect(&mutations)?;
                driver.sequence(sequence_id, &mutations)?;
                commits += 1;
            }
            LogEntry::Commit { txid, sequence_id } => {
                let mutations = pending.remove(&txid).ok_or_else(|| {
                    CoreError::wal_corruption(format!(
                        "commit of {txid} without submit (offset {offset})"
                    ))
                })?;
                driver.sequence(sequence_id, &mutations)?;
                commits += 1;
            }
            LogEntry::Rollback { txid } => {
                pending.remove(&txid);
            }
        }
        Ok(())
    })?;

    tracing::info!(driver = label, commits, "re-sequenced driver from log");
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationKind;
    use crate::types::DocumentId;
    use parking_lot::Mutex;
    use shardb_storage::InMemoryBackend;

    fn wal() -> WriteAhead {
        WriteAhead::new(Box::new(InMemoryBackend::new()), false)
    }

    fn logged(storage: &str, doc: u64, body: &[u8]) -> LogMutation {
        LogMutation {
            kind: MutationKind::Modify,
            storage: storage.to_string(),
            document_id: DocumentId::new(doc),
            buffer: body.to_vec(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        sequenced: Mutex<Vec<(u64, Vec<u64>)>>,
        reinspected: Mutex<Vec<u64>>,
    }

    impl Sequenceable for Recorder {
        fn sequence(&self, sequence_id: SequenceId, mutations: &[Mutation]) -> CoreResult<()> {
            self.sequenced.lock().push((
                sequence_id.as_u64(),
                mutations.iter().map(|m| m.document_id.as_u64()).collect(),
            ));
            Ok(())
        }

        fn reinspect(&self, mutation: &Mutation) -> CoreResult<()> {
            self.reinspected.lock().push(mutation.document_id.as_u64());
            Ok(())
        }
    }

    fn sample_log() -> WriteAhead {
        let wal = wal();
        let entries = [
            LogEntry::Submit {
                txid: TransactionId::new(1),
                mutations: vec![logged("docs", 1, b"a")],
            },
            LogEntry::SubmitCommit {
                txid: TransactionId::new(2),
                sequence_id: SequenceId::new(1),
                mutations: vec![logged("docs", 2, b"b"), logged("gone", 9, b"z")],
            },
            LogEntry::Submit {
                txid: TransactionId::new(3),
                mutations: vec![logged("docs", 3, b"c")],
            },
            LogEntry::Commit {
                txid: TransactionId::new(1),
                sequence_id: SequenceId::new(2),
            },
            LogEntry::Submit {
                txid: TransactionId::new(4),
                mutations: vec![logged("docs", 4, b"d")],
            },
            LogEntry::Rollback {
                txid: TransactionId::new(4),
            },
        ];
        for entry in &entries {
            wal.log(entry).unwrap();
        }
        wal
    }

    #[test]
    fn metadata_pass() {
        let recovered = recover_metadata(&sample_log()).unwrap();
        assert_eq!(recovered.next_transaction, 5);
        assert_eq!(recovered.sequence_id, SequenceId::new(2));
        assert_eq!(
            recovered.submitted.keys().copied().collect::<Vec<_>>(),
            vec![TransactionId::new(3)]
        );
        assert_eq!(recovered.summary.unwrap().records, 6);
    }

    #[test]
    fn data_pass_sequences_commits_in_log_order() {
        let wal = sample_log();
        let storages = HashMap::from([("docs".to_string(), StorageIndex(0))]);
        let recorder = Recorder::default();

        let commits = resequence(&wal, &storages, &recorder, "recorder").unwrap();

        assert_eq!(commits, 2);
        assert_eq!(
            *recorder.sequenced.lock(),
            vec![(1, vec![2]), (2, vec![1])]
        );
        // Uncommitted and rolled-back inserts still raise allocation floors.
        assert_eq!(*recorder.reinspected.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn commit_without_submit_is_corruption() {
        let wal = wal();
        wal.log(&LogEntry::Commit {
            txid: TransactionId::new(7),
            sequence_id: SequenceId::new(1),
        })
        .unwrap();
        assert!(matches!(
            recover_metadata(&wal),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn sequence_going_backwards_is_corruption() {
        let wal = wal();
        for (txid, seq) in [(1, 2), (2, 2)] {
            wal.log(&LogEntry::SubmitCommit {
                txid: TransactionId::new(txid),
                sequence_id: SequenceId::new(seq),
                mutations: vec![],
            })
            .unwrap();
        }
        assert!(matches!(
            recover_metadata(&wal),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn empty_log() {
        let recovered = recover_metadata(&wal()).unwrap();
        assert_eq!(recovered.next_transaction, 1);
        assert_eq!(recovered.sequence_id, SequenceId::default());
        assert!(recovered.submitted.is_empty());
    }
}
