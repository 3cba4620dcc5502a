//! Versioned document storage.

use crate::btree::{Btree, KeyCodec};
use crate::cache::RandomAccessFile;
use crate::driver::{
    Document, DriverEnv, FetchRequest, Sequenceable, StorageDriver, StorageFactory, StorageSetup,
};
use crate::error::{CoreError, CoreResult, FetchError};
use crate::mutation::Mutation;
use crate::types::{DocumentId, SequenceId, StorageIndex};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Driver name of [`FlexStorage`].
pub const FLEX_STORAGE: &str = "FlexStorage";

const INDEX_FILE: &str = "index";
const DATA_FILE: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VersionKey {
    document_id: u64,
    sequence_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    offset: u64,
    length: u64,
}

struct VersionCodec;

impl KeyCodec for VersionCodec {
    type Key = VersionKey;
    type Value = Extent;

    fn key_size(&self) -> usize {
        16
    }

    fn value_size(&self) -> usize {
        16
    }

    fn read_key(&self, bytes: &[u8]) -> VersionKey {
        let (doc, seq) = split_u64_pair(bytes);
        VersionKey {
            document_id: doc,
            sequence_id: seq,
        }
    }

    fn write_key(&self, key: &VersionKey, out: &mut [u8]) {
        out[..8].copy_from_slice(&key.document_id.to_le_bytes());
        out[8..16].copy_from_slice(&key.sequence_id.to_le_bytes());
    }

    fn read_value(&self, bytes: &[u8]) -> Extent {
        let (offset, length) = split_u64_pair(bytes);
        Extent { offset, length }
    }

    fn write_value(&self, value: &Extent, out: &mut [u8]) {
        out[..8].copy_from_slice(&value.offset.to_le_bytes());
        out[8..16].copy_from_slice(&value.length.to_le_bytes());
    }
}

fn split_u64_pair(bytes: &[u8]) -> (u64, u64) {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&bytes[..8]);
    second.copy_from_slice(&bytes[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

struct FlexFiles {
    index: Btree<VersionCodec>,
    data: RandomAccessFile,
    data_end: u64,
}

/// Stores every committed version of every document.
///
/// Versions are appended to a `data` file; a B-tree `index` maps
/// (document id, sequence id) to the version's extent. Fetching at a
/// sequence id finds the newest version at or below it.
pub struct FlexStorage {
    identifier: String,
    index: StorageIndex,
    path: PathBuf,
    env: DriverEnv,
    next_document: AtomicU64,
    files: RwLock<Option<FlexFiles>>,
}

impl FlexStorage {
    /// Builds an unopened driver.
    #[must_use]
    pub fn new(setup: StorageSetup) -> Self {
        Self {
            identifier: setup.identifier,
            index: setup.index,
            path: setup.path,
            env: setup.env,
            next_document: AtomicU64::new(1),
            files: RwLock::new(None),
        }
    }

    fn open_files(&mut self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.path)?;
        let index_cache = self.env.open_cache(&self.path.join(INDEX_FILE))?;
        let data_cache = self.env.open_cache(&self.path.join(DATA_FILE))?;
        *self.files.get_mut() = Some(FlexFiles {
            index: Btree::create(index_cache, VersionCodec)?,
            data: RandomAccessFile::new(data_cache),
            data_end: 0,
        });
        Ok(())
    }

    fn not_open(&self) -> CoreError {
        CoreError::invariant(format!("storage '{}' used before it was opened", self.identifier))
    }

    fn raise_floor(&self, document_id: DocumentId) {
        self.next_document
            .fetch_max(document_id.as_u64().saturating_add(1), Ordering::SeqCst);
    }
}

impl Sequenceable for FlexStorage {
    fn sequence(&self, sequence_id: SequenceId, mutations: &[Mutation]) -> CoreResult<()> {
        let mut guard = self.files.write();
        let files = guard.as_mut().ok_or_else(|| self.not_open())?;

        for mutation in mutations.iter().filter(|m| m.storage == self.index) {
            let extent = Extent {
                offset: files.data_end,
                length: mutation.buffer.len() as u64,
            };
            files.data.write(extent.offset, &mutation.buffer)?;
            files.data_end += extent.length;

            let key = VersionKey {
                document_id: mutation.document_id.as_u64(),
                sequence_id: sequence_id.as_u64(),
            };
            files.index.insert(&key, &extent, |entry| Ok(entry.cmp(&key)))?;
            self.raise_floor(mutation.document_id);
        }
        Ok(())
    }

    fn reinspect(&self, mutation: &Mutation) -> CoreResult<()> {
        if mutation.storage == self.index {
            self.raise_floor(mutation.document_id);
        }
        Ok(())
    }
}

impl StorageDriver for FlexStorage {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn create_storage(&mut self) -> CoreResult<()> {
        self.open_files()?;
        tracing::info!(storage = %self.identifier, "created FlexStorage");
        Ok(())
    }

    fn load_storage(&mut self) -> CoreResult<()> {
        // Versions are rebuilt from the log on every load.
        self.open_files()?;
        tracing::info!(storage = %self.identifier, "loaded FlexStorage");
        Ok(())
    }

    fn allocate(&self) -> DocumentId {
        DocumentId::new(self.next_document.fetch_add(1, Ordering::SeqCst))
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Document, FetchError> {
        let guard = self.files.read();
        let files = guard.as_ref().ok_or_else(|| self.not_open())?;

        let target = VersionKey {
            document_id: request.document_id.as_u64(),
            sequence_id: request.sequence_id.as_u64(),
        };
        let found = files.index.find_prev(|entry| Ok(entry.cmp(&target)))?;
        let cursor = files.index.cursor(found)?;
        if !cursor.valid() {
            return Err(FetchError::DocumentNotFound);
        }
        let key = cursor.key()?;
        if key.document_id != target.document_id {
            return Err(FetchError::DocumentNotFound);
        }
        let extent = cursor.value()?;
        drop(cursor);

        let buffer = files.data.read(extent.offset, extent.length as usize)?;
        Ok(Document {
            document_id: request.document_id,
            sequence_id: SequenceId::new(key.sequence_id),
            buffer,
        })
    }
}

impl std::fmt::Debug for FlexStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlexStorage")
            .field("identifier", &self.identifier)
            .field("index", &self.index)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Factory for [`FlexStorage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlexStorageFactory;

impl StorageFactory for FlexStorageFactory {
    fn name(&self) -> &str {
        FLEX_STORAGE
    }

    fn build(&self, setup: StorageSetup) -> CoreResult<Box<dyn StorageDriver>> {
        Ok(Box::new(FlexStorage::new(setup)))
    }
}
