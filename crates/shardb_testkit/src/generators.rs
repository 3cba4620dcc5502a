//! Property-based test generators using proptest.
//!
//! Provides strategies for documents, identifiers and whole operation
//! sequences, plus a model that replays a sequence against a shard and
//! remembers what every document should contain.

use crate::fixtures::TestShard;
use proptest::prelude::*;
use shardb_core::{DocumentId, Mutation, SequenceId, StorageIndex};
use std::collections::BTreeMap;

/// Strategy for document bodies, including empty and multi-page ones.
pub fn document_body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 0..64),
        1 => prop::collection::vec(any::<u8>(), 512..3000),
    ]
}

/// Strategy for storage and view identifiers accepted by a shard.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_.-]{0,31}").expect("Invalid regex")
}

/// One step of a generated workload.
#[derive(Debug, Clone)]
pub enum ShardOp {
    /// Insert a document and commit.
    Insert {
        /// Document contents.
        body: Vec<u8>,
    },
    /// Write a new version of an earlier document and commit.
    Modify {
        /// Picks the target among documents inserted so far.
        target: usize,
        /// Document contents.
        body: Vec<u8>,
    },
    /// Insert a document, submit, then roll back.
    RolledBack {
        /// Document contents.
        body: Vec<u8>,
    },
    /// Close the shard and open it again.
    Reopen,
}

/// Strategy for a single workload step.
pub fn shard_op_strategy() -> impl Strategy<Value = ShardOp> {
    prop_oneof![
        4 => document_body_strategy().prop_map(|body| ShardOp::Insert { body }),
        3 => (any::<usize>(), document_body_strategy())
            .prop_map(|(target, body)| ShardOp::Modify { target, body }),
        1 => document_body_strategy().prop_map(|body| ShardOp::RolledBack { body }),
        1 => Just(ShardOp::Reopen),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn shard_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<ShardOp>> {
    prop::collection::vec(shard_op_strategy(), 1..=max_len)
}

/// Expected contents of one storage after a workload.
#[derive(Debug, Default, Clone)]
pub struct ShardModel {
    /// Latest body and commit sequence id of every document.
    pub documents: BTreeMap<DocumentId, (Vec<u8>, SequenceId)>,
    /// Insertion order, used to resolve [`ShardOp::Modify`] targets.
    pub order: Vec<DocumentId>,
    /// Sequence id of the last commit.
    pub last_sequence: SequenceId,
}

impl ShardModel {
    /// Runs `ops` against `storage` of `shard`, checking every assigned
    /// sequence id, and returns the resulting model.
    pub fn run(shard: &mut TestShard, storage: &str, ops: &[ShardOp]) -> Self {
        let mut model = Self::default();
        let mut index = shard.storage(storage);
        for op in ops {
            match op {
                ShardOp::Insert { body } => {
                    let (id, seq) = shard.insert(index, body);
                    model.record(id, body, seq);
                    model.order.push(id);
                }
                ShardOp::Modify { target, body } => {
                    if model.order.is_empty() {
                        continue;
                    }
                    let id = model.order[target % model.order.len()];
                    let seq = shard.modify(index, id, body);
                    model.record(id, body, seq);
                }
                ShardOp::RolledBack { body } => {
                    let tx = shard.transaction().expect("Failed to open transaction");
                    shard
                        .update_mutation(tx, Mutation::insert(index, body.clone()))
                        .expect("Failed to add mutation");
                    shard
                        .submit(tx)
                        .expect("Failed to queue submit")
                        .wait()
                        .expect("Submit failed");
                    shard
                        .rollback(tx)
                        .expect("Failed to queue rollback")
                        .wait()
                        .expect("Rollback failed");
                }
                ShardOp::Reopen => {
                    shard.reopen();
                    index = shard.storage(storage);
                }
            }
        }
        model
    }

    fn record(&mut self, id: DocumentId, body: &[u8], seq: SequenceId) {
        assert_eq!(seq, self.last_sequence.next(), "sequence ids must be dense");
        self.last_sequence = seq;
        self.documents.insert(id, (body.to_vec(), seq));
    }

    /// Asserts that every document of `storage` reads back as modeled.
    pub fn check(&self, shard: &TestShard, storage: StorageIndex) {
        assert_eq!(shard.current_sequence_id(), self.last_sequence);
        for (id, (body, seq)) in &self.documents {
            let doc = shard
                .fetch(storage, *id, None)
                .expect("Failed to queue fetch")
                .wait()
                .expect("Fetch failed");
            assert_eq!(&doc.buffer, body, "contents of {id}");
            assert_eq!(doc.sequence_id, *seq, "version of {id}");
        }
    }
}
