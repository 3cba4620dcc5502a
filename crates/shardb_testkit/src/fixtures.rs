//! Test fixtures and shard helpers.
//!
//! Provides temporary shards that can be closed and reopened in place, so
//! recovery can be checked against the same directory.

use shardb_core::{
    Config, DocumentId, DriverRegistry, Mutation, SequenceId, Shard, StorageIndex, FLEX_STORAGE,
};
use std::path::Path;
use tempfile::TempDir;

/// Config used by test shards: no fsync, a small cache and small pages, so
/// that eviction and node splits happen with little data.
pub fn test_config() -> Config {
    Config::new()
        .sync_on_commit(false)
        .page_size(512)
        .cache_limit(16 * 512)
}

/// A shard in a temporary directory, removed on drop.
pub struct TestShard {
    shard: Option<Shard>,
    config: Config,
    temp_dir: TempDir,
}

impl TestShard {
    /// Creates a shard with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a shard with the given config.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let shard = Shard::create(temp_dir.path(), config.clone(), DriverRegistry::with_builtin())
            .expect("Failed to create shard");
        Self {
            shard: Some(shard),
            config,
            temp_dir,
        }
    }

    /// Directory of the shard.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Closes the shard, waiting for its coordinator to stop.
    pub fn close(&mut self) {
        self.shard = None;
    }

    /// Closes the shard if needed and opens it again from disk.
    pub fn reopen(&mut self) {
        self.close();
        let shard = Shard::open(
            self.temp_dir.path(),
            self.config.clone(),
            DriverRegistry::with_builtin(),
        )
        .expect("Failed to reopen shard");
        self.shard = Some(shard);
    }

    /// Returns the storage with this identifier, creating a
    /// [`FLEX_STORAGE`] storage if there is none.
    pub fn storage(&self, identifier: &str) -> StorageIndex {
        match self.shard().storage(identifier) {
            Some(index) => index,
            None => self
                .shard()
                .create_storage(FLEX_STORAGE, identifier)
                .expect("Failed to create storage"),
        }
    }

    /// Inserts one document in its own transaction.
    pub fn insert(&self, storage: StorageIndex, body: &[u8]) -> (DocumentId, SequenceId) {
        self.commit_one(Mutation::insert(storage, body.to_vec()))
    }

    /// Writes a new version of a document in its own transaction.
    pub fn modify(&self, storage: StorageIndex, id: DocumentId, body: &[u8]) -> SequenceId {
        self.commit_one(Mutation::modify(storage, id, body.to_vec())).1
    }

    fn commit_one(&self, mutation: Mutation) -> (DocumentId, SequenceId) {
        let shard = self.shard();
        let tx = shard.transaction().expect("Failed to open transaction");
        let id = shard
            .update_mutation(tx, mutation)
            .expect("Failed to add mutation");
        let seq = shard
            .submit_commit(tx)
            .expect("Failed to queue commit")
            .wait()
            .expect("Commit failed");
        (id, seq)
    }

    /// Reads the latest version of a document.
    pub fn read(&self, storage: StorageIndex, id: DocumentId) -> Vec<u8> {
        self.shard()
            .fetch(storage, id, None)
            .expect("Failed to queue fetch")
            .wait()
            .expect("Fetch failed")
            .buffer
    }

    fn shard(&self) -> &Shard {
        self.shard.as_ref().expect("Shard is closed")
    }
}

impl Default for TestShard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestShard {
    type Target = Shard;

    fn deref(&self) -> &Self::Target {
        self.shard()
    }
}

/// Runs a test with a temporary shard.
///
/// # Example
///
/// ```rust,ignore
/// use shardb_testkit::with_temp_shard;
///
/// #[test]
/// fn my_test() {
///     with_temp_shard(|shard| {
///         let docs = shard.storage("docs");
///         shard.insert(docs, b"body");
///     });
/// }
/// ```
pub fn with_temp_shard<F, R>(f: F) -> R
where
    F: FnOnce(&TestShard) -> R,
{
    let shard = TestShard::new();
    f(&shard)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A shard with one storage `docs` holding `count` documents whose
    /// bodies are `doc-<n>`.
    pub fn populated_shard(count: usize) -> (TestShard, StorageIndex, Vec<DocumentId>) {
        let shard = TestShard::new();
        let docs = shard.storage("docs");
        let ids = (0..count)
            .map(|i| shard.insert(docs, format!("doc-{i}").as_bytes()).0)
            .collect();
        (shard, docs, ids)
    }
}
