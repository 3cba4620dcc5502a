//! Restart and crash recovery from the write-ahead log.

use shardb_core::{
    Config, CoreError, DriverRegistry, Mutation, QueryRequest, SequenceId, Shard, StorageIndex,
    TransactionState, ViewSettings, FLEX_STORAGE, ORDERED_VIEW,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn open(path: &Path) -> Shard {
    Shard::open(path, Config::new().sync_on_commit(false), DriverRegistry::with_builtin()).unwrap()
}

fn wal_path(path: &Path) -> PathBuf {
    path.join("transact.wal")
}

fn docs_storage(shard: &Shard) -> StorageIndex {
    match shard.storage("docs") {
        Some(docs) => docs,
        None => shard.create_storage(FLEX_STORAGE, "docs").unwrap(),
    }
}

fn keys(shard: &Shard, request: QueryRequest) -> Vec<Vec<u8>> {
    let view = shard.view("by_body").unwrap();
    shard
        .query(view, request)
        .unwrap()
        .wait()
        .unwrap()
        .into_iter()
        .map(|row| row.key)
        .collect()
}

#[test]
fn submitted_transaction_survives_restart() {
    let dir = tempdir().unwrap();
    let (tx, id) = {
        let shard = open(dir.path());
        let docs = docs_storage(&shard);
        let tx = shard.transaction().unwrap();
        let id = shard
            .update_mutation(tx, Mutation::insert(docs, b"pending".to_vec()))
            .unwrap();
        shard.submit(tx).unwrap().wait().unwrap();
        (tx, id)
    };

    let shard = open(dir.path());
    let docs = docs_storage(&shard);
    assert_eq!(shard.transaction_state(tx), Some(TransactionState::Submitted));
    assert_eq!(shard.current_sequence_id(), SequenceId::default());
    assert!(shard.fetch(docs, id, None).unwrap().wait().is_err());

    let seq = shard.commit(tx).unwrap().wait().unwrap();
    assert_eq!(seq, SequenceId::new(1));
    assert_eq!(shard.fetch(docs, id, None).unwrap().wait().unwrap().buffer, b"pending");
    assert!(matches!(
        shard.commit(tx),
        Err(CoreError::IllegalTransaction { .. })
    ));
    drop(shard);

    // Committed once: nothing left to restore, nothing applied twice.
    let shard = open(dir.path());
    let docs = docs_storage(&shard);
    assert_eq!(shard.transaction_state(tx), None);
    assert_eq!(shard.current_sequence_id(), SequenceId::new(1));
    let doc = shard.fetch(docs, id, None).unwrap().wait().unwrap();
    assert_eq!(doc.sequence_id, SequenceId::new(1));
}

#[test]
fn rolled_back_submit_stays_dead() {
    let dir = tempdir().unwrap();
    let tx = {
        let shard = open(dir.path());
        let docs = docs_storage(&shard);
        let tx = shard.transaction().unwrap();
        shard
            .update_mutation(tx, Mutation::insert(docs, b"gone".to_vec()))
            .unwrap();
        shard.submit(tx).unwrap().wait().unwrap();
        shard.rollback(tx).unwrap().wait().unwrap();
        tx
    };

    let shard = open(dir.path());
    assert_eq!(shard.transaction_state(tx), None);
    assert!(shard.engine().submitted_transactions().is_empty());
    // Transaction ids are not reused.
    assert!(shard.transaction().unwrap() > tx);
}

#[test]
fn torn_tail_is_discarded() {
    let dir = tempdir().unwrap();
    let id = {
        let shard = open(dir.path());
        let docs = docs_storage(&shard);
        let tx = shard.transaction().unwrap();
        let id = shard
            .update_mutation(tx, Mutation::insert(docs, b"kept".to_vec()))
            .unwrap();
        shard.submit_commit(tx).unwrap().wait().unwrap();
        id
    };
    let intact = fs::metadata(wal_path(dir.path())).unwrap().len();

    // A record header promising more bytes than were written.
    let mut file = OpenOptions::new()
        .append(true)
        .open(wal_path(dir.path()))
        .unwrap();
    file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    drop(file);

    let shard = open(dir.path());
    assert_eq!(fs::metadata(wal_path(dir.path())).unwrap().len(), intact);
    let docs = docs_storage(&shard);
    assert_eq!(shard.fetch(docs, id, None).unwrap().wait().unwrap().buffer, b"kept");

    let tx = shard.transaction().unwrap();
    shard
        .update_mutation(tx, Mutation::insert(docs, b"after".to_vec()))
        .unwrap();
    assert_eq!(shard.submit_commit(tx).unwrap().wait().unwrap(), SequenceId::new(2));
    drop(shard);

    let shard = open(dir.path());
    assert_eq!(shard.current_sequence_id(), SequenceId::new(2));
}

#[test]
fn digest_mismatch_refuses_to_open() {
    let dir = tempdir().unwrap();
    {
        let shard = open(dir.path());
        let docs = docs_storage(&shard);
        let tx = shard.transaction().unwrap();
        shard
            .update_mutation(tx, Mutation::insert(docs, b"data".to_vec()))
            .unwrap();
        shard.submit_commit(tx).unwrap().wait().unwrap();
    }

    let mut bytes = fs::read(wal_path(dir.path())).unwrap();
    // First payload byte, after the length and the digest.
    bytes[20] ^= 0xFF;
    fs::write(wal_path(dir.path()), &bytes).unwrap();

    let result = Shard::open(
        dir.path(),
        Config::new().sync_on_commit(false),
        DriverRegistry::with_builtin(),
    );
    assert!(matches!(result, Err(CoreError::WalCorruption { .. })));
}

#[test]
fn view_is_rebuilt_after_restart() {
    let dir = tempdir().unwrap();
    {
        let shard = open(dir.path());
        let docs = docs_storage(&shard);
        shard
            .create_view(ORDERED_VIEW, "by_body", ViewSettings::new("docs", "raw"))
            .unwrap();

        let mut ids = Vec::new();
        for body in [&b"pear"[..], b"apple", b"fig", b"kiwi"] {
            let tx = shard.transaction().unwrap();
            ids.push(
                shard
                    .update_mutation(tx, Mutation::insert(docs, body.to_vec()))
                    .unwrap(),
            );
            shard.submit_commit(tx).unwrap().wait().unwrap();
        }

        // pear becomes banana.
        let tx = shard.transaction().unwrap();
        shard
            .update_mutation(tx, Mutation::modify(docs, ids[0], b"banana".to_vec()))
            .unwrap();
        shard.submit_commit(tx).unwrap().wait().unwrap();

        assert_eq!(
            keys(&shard, QueryRequest::new()),
            vec![b"apple".to_vec(), b"banana".to_vec(), b"fig".to_vec(), b"kiwi".to_vec()]
        );
    }

    let shard = open(dir.path());
    assert_eq!(
        keys(&shard, QueryRequest::new()),
        vec![b"apple".to_vec(), b"banana".to_vec(), b"fig".to_vec(), b"kiwi".to_vec()]
    );
    assert_eq!(
        keys(&shard, QueryRequest::new().from_key(b"b".to_vec()).to_key(b"g".to_vec())),
        vec![b"banana".to_vec(), b"fig".to_vec()]
    );
    assert_eq!(
        keys(&shard, QueryRequest::new().limit(1)),
        vec![b"apple".to_vec()]
    );
    // Before the modify, pear was still pear.
    assert_eq!(
        keys(&shard, QueryRequest::new().at_sequence(SequenceId::new(4))),
        vec![b"apple".to_vec(), b"fig".to_vec(), b"kiwi".to_vec(), b"pear".to_vec()]
    );
}

#[test]
fn view_created_late_indexes_earlier_commits() {
    let dir = tempdir().unwrap();
    let shard = open(dir.path());
    let docs = docs_storage(&shard);
    for body in [&b"b"[..], b"a"] {
        let tx = shard.transaction().unwrap();
        shard
            .update_mutation(tx, Mutation::insert(docs, body.to_vec()))
            .unwrap();
        shard.submit_commit(tx).unwrap().wait().unwrap();
    }

    shard
        .create_view(ORDERED_VIEW, "by_body", ViewSettings::new("docs", "raw"))
        .unwrap();
    assert_eq!(
        keys(&shard, QueryRequest::new()),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
}
