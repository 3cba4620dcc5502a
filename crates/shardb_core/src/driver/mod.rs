//! Storage and view drivers.
//!
//! A driver owns its files and applies committed mutations in sequence
//! order. The engine only talks to drivers through the traits below and
//! never looks at their on-disk formats.
//!
//! Each driver runs behind a [`DriverQueue`], which alternates between a
//! request phase (any number of concurrent fetches or queries) and a
//! sequence phase (one commit at a time, no readers).

mod flex_storage;
mod ordered_view;
mod queue;
mod registry;

pub use flex_storage::{FlexStorage, FlexStorageFactory, FLEX_STORAGE};
pub use ordered_view::{KeyExtractor, OrderedView, OrderedViewFactory, RawBytes, ORDERED_VIEW};
pub use queue::{DriverQueue, SequenceDone};
pub use registry::{DriverRegistry, StorageFactory, ViewFactory};

use crate::cache::{CacheHost, PageCache};
use crate::error::{CoreResult, FetchError, QueryError};
use crate::mutation::Mutation;
use crate::tasks::TaskPool;
use crate::types::{DocumentId, SequenceId, StorageIndex, ViewIndex};
use shardb_storage::FileBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A storage driver behind its queue.
pub type StorageQueue = DriverQueue<dyn StorageDriver>;
/// A view driver behind its queue.
pub type ViewQueue = DriverQueue<dyn ViewDriver>;

/// Applies committed mutations.
pub trait Sequenceable: Send + Sync {
    /// Applies the mutations of one committed transaction. Mutations that
    /// target other storages are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver's files cannot be written.
    fn sequence(&self, sequence_id: SequenceId, mutations: &[Mutation]) -> CoreResult<()>;

    /// Sees a logged mutation during recovery, before any new writes, so
    /// that driver-local counters can be restored.
    ///
    /// # Errors
    ///
    /// Returns an error if driver state cannot be updated.
    fn reinspect(&self, mutation: &Mutation) -> CoreResult<()>;
}

/// Owns documents and fetches them by id.
pub trait StorageDriver: Sequenceable {
    /// Identifier the storage was set up under.
    fn identifier(&self) -> &str;

    /// Creates the driver's files for a new storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be created.
    fn create_storage(&mut self) -> CoreResult<()>;

    /// Opens the driver's files for an existing storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened.
    fn load_storage(&mut self) -> CoreResult<()>;

    /// Allocates a fresh document id. Ids are never reused.
    fn allocate(&self) -> DocumentId;

    /// Returns the newest version of a document visible at the requested
    /// sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::DocumentNotFound`] if no such version exists.
    fn fetch(&self, request: &FetchRequest) -> Result<Document, FetchError>;
}

/// Owns a derived, ordered index over the documents of a storage.
pub trait ViewDriver: Sequenceable {
    /// Identifier the view was set up under.
    fn identifier(&self) -> &str;

    /// Creates the driver's files for a new view.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be created.
    fn create_view(&mut self) -> CoreResult<()>;

    /// Opens the driver's files for an existing view.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened.
    fn load_view(&mut self) -> CoreResult<()>;

    /// Runs an ordered range query.
    ///
    /// # Errors
    ///
    /// Returns an error if the view or its base storage cannot be read.
    fn query(&self, request: &QueryRequest) -> Result<Vec<QueryRow>, QueryError>;
}

/// Which document version to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// The document.
    pub document_id: DocumentId,
    /// Newest sequence id that may be returned.
    pub sequence_id: SequenceId,
}

/// One stored version of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// The document.
    pub document_id: DocumentId,
    /// Sequence id of the commit that wrote this version.
    pub sequence_id: SequenceId,
    /// The document contents.
    pub buffer: Vec<u8>,
}

/// Bounds of a view query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    /// Smallest key to report, inclusive.
    pub from_key: Option<Vec<u8>>,
    /// Largest key to report, inclusive.
    pub to_key: Option<Vec<u8>>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Visibility; the engine fills in the current sequence id if unset.
    pub sequence_id: Option<SequenceId>,
}

impl QueryRequest {
    /// An unbounded query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts at `key`.
    #[must_use]
    pub fn from_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.from_key = Some(key.into());
        self
    }

    /// Stops after `key`.
    #[must_use]
    pub fn to_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.to_key = Some(key.into());
        self
    }

    /// Reports at most `limit` rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reads the state as of `sequence_id`.
    #[must_use]
    pub fn at_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

/// One row reported by a view query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    /// Extracted key the row is ordered by.
    pub key: Vec<u8>,
    /// The document.
    pub document_id: DocumentId,
    /// Sequence id of the reported version.
    pub sequence_id: SequenceId,
    /// The document contents.
    pub buffer: Vec<u8>,
}

/// Shared resources handed to every driver of a shard.
#[derive(Clone)]
pub struct DriverEnv {
    /// Memory budget for all page caches.
    pub host: Arc<CacheHost>,
    /// Workers for page reads and write-backs.
    pub io: Arc<TaskPool>,
    /// Workers for queued driver requests.
    pub process: Arc<TaskPool>,
    /// Page size for driver files.
    pub page_size: usize,
}

impl DriverEnv {
    /// Opens a page cache over `path`, truncating the file first. Derived
    /// driver files are rebuilt from the log on every load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn open_cache(&self, path: &Path) -> CoreResult<PageCache> {
        let backend = FileBackend::create(path)?;
        PageCache::open(
            Arc::clone(&self.host),
            Arc::clone(&self.io),
            Box::new(backend),
            self.page_size,
        )
    }
}

impl std::fmt::Debug for DriverEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverEnv")
            .field("host", &self.host)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Everything a storage factory needs to build a driver.
#[derive(Debug)]
pub struct StorageSetup {
    /// Identifier of the storage.
    pub identifier: String,
    /// Slot of the storage inside the engine.
    pub index: StorageIndex,
    /// Directory owned by the driver.
    pub path: PathBuf,
    /// Shared resources.
    pub env: DriverEnv,
}

/// Persistent settings of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSettings {
    /// Identifier of the storage whose documents are indexed.
    pub base_storage: String,
    /// Name of the key extractor.
    pub extractor: String,
}

impl ViewSettings {
    /// Settings for a view over `base_storage` using `extractor`.
    pub fn new(base_storage: impl Into<String>, extractor: impl Into<String>) -> Self {
        Self {
            base_storage: base_storage.into(),
            extractor: extractor.into(),
        }
    }
}

/// Everything a view factory needs to build a driver.
pub struct ViewSetup {
    /// Identifier of the view.
    pub identifier: String,
    /// Slot of the view inside the engine.
    pub index: ViewIndex,
    /// Directory owned by the driver.
    pub path: PathBuf,
    /// Shared resources.
    pub env: DriverEnv,
    /// Persistent settings.
    pub settings: ViewSettings,
    /// Slot of the base storage.
    pub base_index: StorageIndex,
    /// The base storage, for fetching indexed documents.
    pub base: Arc<StorageQueue>,
}

impl std::fmt::Debug for ViewSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSetup")
            .field("identifier", &self.identifier)
            .field("index", &self.index)
            .field("path", &self.path)
            .field("settings", &self.settings)
            .field("base_index", &self.base_index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn env(page_size: usize, cache_pages: u64) -> DriverEnv {
        DriverEnv {
            host: Arc::new(CacheHost::new(cache_pages * page_size as u64)),
            io: Arc::new(TaskPool::new("driver-io", 2).unwrap()),
            process: Arc::new(TaskPool::new("driver-process", 2).unwrap()),
            page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_cache_starts_from_an_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, vec![7u8; 1024]).unwrap();

        let cache = testing::env(256, 4).open_cache(&path).unwrap();
        assert_eq!(cache.file_size().unwrap(), 0);
        assert!(cache.read_page(1).unwrap().read().iter().all(|&b| b == 0));
    }
}
