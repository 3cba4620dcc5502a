//! Secondary index ordered by an extracted key.

use crate::btree::{Btree, KeyCodec};
use crate::cache::RandomAccessFile;
use crate::driver::{
    DriverEnv, FetchRequest, QueryRequest, QueryRow, Sequenceable, StorageQueue, ViewDriver,
    ViewFactory, ViewSetup,
};
use crate::error::{CoreError, CoreResult, FetchError, QueryError};
use crate::mutation::Mutation;
use crate::types::{DocumentId, SequenceId, StorageIndex, ViewIndex};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Driver name of [`OrderedView`].
pub const ORDERED_VIEW: &str = "OrderedView";

const KEYS_FILE: &str = "keys";
const ORDER_FILE: &str = "order";

/// Turns documents into sortable keys.
///
/// This is the plugin boundary of [`OrderedView`]: the view stores whatever
/// bytes `extract` returns and orders them with `compare`.
pub trait KeyExtractor: Send + Sync {
    /// Name stored in view settings.
    fn name(&self) -> &str;

    /// Key for one document version, or `None` to leave it out of the view.
    fn extract(&self, document_id: DocumentId, buffer: &[u8]) -> Option<Vec<u8>>;

    /// Orders two extracted keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Orders documents by their raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl KeyExtractor for RawBytes {
    fn name(&self) -> &str {
        "raw"
    }

    fn extract(&self, _document_id: DocumentId, buffer: &[u8]) -> Option<Vec<u8>> {
        Some(buffer.to_vec())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Where a key lives in the key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyRef {
    offset: u64,
    length: u32,
}

/// The document version a key was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    document_id: DocumentId,
    sequence_id: SequenceId,
}

struct OrderCodec;

impl KeyCodec for OrderCodec {
    type Key = KeyRef;
    type Value = Link;

    fn key_size(&self) -> usize {
        12
    }

    fn value_size(&self) -> usize {
        16
    }

    fn read_key(&self, bytes: &[u8]) -> KeyRef {
        let mut offset = [0u8; 8];
        let mut length = [0u8; 4];
        offset.copy_from_slice(&bytes[..8]);
        length.copy_from_slice(&bytes[8..12]);
        KeyRef {
            offset: u64::from_le_bytes(offset),
            length: u32::from_le_bytes(length),
        }
    }

    fn write_key(&self, key: &KeyRef, out: &mut [u8]) {
        out[..8].copy_from_slice(&key.offset.to_le_bytes());
        out[8..12].copy_from_slice(&key.length.to_le_bytes());
    }

    fn read_value(&self, bytes: &[u8]) -> Link {
        let mut document = [0u8; 8];
        let mut sequence = [0u8; 8];
        document.copy_from_slice(&bytes[..8]);
        sequence.copy_from_slice(&bytes[8..16]);
        Link {
            document_id: DocumentId::new(u64::from_le_bytes(document)),
            sequence_id: SequenceId::new(u64::from_le_bytes(sequence)),
        }
    }

    fn write_value(&self, value: &Link, out: &mut [u8]) {
        out[..8].copy_from_slice(&value.document_id.as_u64().to_le_bytes());
        out[8..16].copy_from_slice(&value.sequence_id.as_u64().to_le_bytes());
    }
}

struct ViewFiles {
    order: Btree<OrderCodec>,
    keys: RandomAccessFile,
    keys_end: u64,
}

impl ViewFiles {
    fn read_key(&self, key: &KeyRef) -> CoreResult<Vec<u8>> {
        self.keys.read(key.offset, key.length as usize)
    }
}

/// Orders the documents of one storage by an extracted key.
///
/// Every committed version adds a key to the append-only `keys` file and a
/// (key reference, document version) entry to the `order` B-tree, so each
/// comparison reads the key file. Queries report a document only through
/// the entry of its newest version visible at the query's sequence id.
pub struct OrderedView {
    identifier: String,
    index: ViewIndex,
    path: PathBuf,
    env: DriverEnv,
    base_index: StorageIndex,
    base: Arc<StorageQueue>,
    extractor: Arc<dyn KeyExtractor>,
    files: RwLock<Option<ViewFiles>>,
}

impl OrderedView {
    /// Builds an unopened driver.
    #[must_use]
    pub fn new(setup: ViewSetup, extractor: Arc<dyn KeyExtractor>) -> Self {
        Self {
            identifier: setup.identifier,
            index: setup.index,
            path: setup.path,
            env: setup.env,
            base_index: setup.base_index,
            base: setup.base,
            extractor,
            files: RwLock::new(None),
        }
    }

    fn open_files(&mut self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.path)?;
        let order_cache = self.env.open_cache(&self.path.join(ORDER_FILE))?;
        let keys_cache = self.env.open_cache(&self.path.join(KEYS_FILE))?;
        *self.files.get_mut() = Some(ViewFiles {
            order: Btree::create(order_cache, OrderCodec)?,
            keys: RandomAccessFile::new(keys_cache),
            keys_end: 0,
        });
        Ok(())
    }

    fn not_open(&self) -> CoreError {
        CoreError::invariant(format!("view '{}' used before it was opened", self.identifier))
    }

    /// Slot of this view.
    #[must_use]
    pub fn index(&self) -> ViewIndex {
        self.index
    }
}

impl Sequenceable for OrderedView {
    fn sequence(&self, sequence_id: SequenceId, mutations: &[Mutation]) -> CoreResult<()> {
        let mut guard = self.files.write();
        let files = guard.as_mut().ok_or_else(|| self.not_open())?;

        for mutation in mutations.iter().filter(|m| m.storage == self.base_index) {
            let Some(key) = self.extractor.extract(mutation.document_id, &mutation.buffer) else {
                continue;
            };
            let length = u32::try_from(key.len())
                .map_err(|_| CoreError::invalid_format("view key exceeds 4 GiB"))?;
            let key_ref = KeyRef {
                offset: files.keys_end,
                length,
            };
            files.keys.write(key_ref.offset, &key)?;
            files.keys_end += u64::from(length);

            let link = Link {
                document_id: mutation.document_id,
                sequence_id,
            };
            let ViewFiles { order, keys, .. } = &mut *files;
            let extractor = &self.extractor;
            // Equal keys keep insertion order.
            order.insert(&key_ref, &link, |entry| {
                let stored = keys.read(entry.offset, entry.length as usize)?;
                Ok(extractor
                    .compare(&stored, &key)
                    .then(entry.offset.cmp(&key_ref.offset)))
            })?;
        }
        Ok(())
    }

    fn reinspect(&self, _mutation: &Mutation) -> CoreResult<()> {
        Ok(())
    }
}

impl ViewDriver for OrderedView {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn create_view(&mut self) -> CoreResult<()> {
        self.open_files()?;
        tracing::info!(
            view = %self.identifier,
            extractor = self.extractor.name(),
            "created OrderedView"
        );
        Ok(())
    }

    fn load_view(&mut self) -> CoreResult<()> {
        // The order is rebuilt from the log on every load.
        self.open_files()?;
        tracing::info!(
            view = %self.identifier,
            extractor = self.extractor.name(),
            "loaded OrderedView"
        );
        Ok(())
    }

    fn query(&self, request: &QueryRequest) -> Result<Vec<QueryRow>, QueryError> {
        let guard = self.files.read();
        let files = guard.as_ref().ok_or_else(|| self.not_open())?;
        let visible = request.sequence_id.unwrap_or(SequenceId::new(u64::MAX));
        let limit = request.limit.unwrap_or(usize::MAX);

        let start = match &request.from_key {
            Some(from) => files.order.find_next(|entry| {
                let stored = files.read_key(entry)?;
                Ok(self.extractor.compare(&stored, from))
            })?,
            None => files.order.find_first()?,
        };

        let mut rows = Vec::new();
        let mut cursor = files.order.cursor(start)?;
        while cursor.valid() && rows.len() < limit {
            let key_ref = cursor.key()?;
            let link = cursor.value()?;
            let key = files.read_key(&key_ref)?;

            if let Some(to) = &request.to_key {
                if self.extractor.compare(&key, to) == Ordering::Greater {
                    break;
                }
            }

            if link.sequence_id <= visible {
                let fetch = FetchRequest {
                    document_id: link.document_id,
                    sequence_id: visible,
                };
                match self.base.call(|storage| storage.fetch(&fetch)) {
                    // Older entries of a document that changed since are skipped.
                    Ok(document) if document.sequence_id == link.sequence_id => {
                        rows.push(QueryRow {
                            key,
                            document_id: document.document_id,
                            sequence_id: document.sequence_id,
                            buffer: document.buffer,
                        });
                    }
                    Ok(_) | Err(FetchError::DocumentNotFound) => {}
                    Err(FetchError::Storage(err)) => return Err(err.into()),
                }
            }
            cursor.forward()?;
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for OrderedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedView")
            .field("identifier", &self.identifier)
            .field("index", &self.index)
            .field("base_index", &self.base_index)
            .field("extractor", &self.extractor.name())
            .finish_non_exhaustive()
    }
}

/// Factory for [`OrderedView`], holding the available key extractors.
#[derive(Clone, Default)]
pub struct OrderedViewFactory {
    extractors: HashMap<String, Arc<dyn KeyExtractor>>,
}

impl OrderedViewFactory {
    /// A factory without extractors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with the [`RawBytes`] extractor.
    #[must_use]
    pub fn with_builtin() -> Self {
        Self::new().with_extractor(Arc::new(RawBytes))
    }

    /// Adds or replaces an extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractors.insert(extractor.name().to_string(), extractor);
        self
    }
}

impl ViewFactory for OrderedViewFactory {
    fn name(&self) -> &str {
        ORDERED_VIEW
    }

    fn build(&self, setup: ViewSetup) -> CoreResult<Box<dyn ViewDriver>> {
        let extractor = self
            .extractors
            .get(&setup.settings.extractor)
            .cloned()
            .ok_or_else(|| {
                CoreError::driver_not_found(format!(
                    "{ORDERED_VIEW} extractor '{}'",
                    setup.settings.extractor
                ))
            })?;
        Ok(Box::new(OrderedView::new(setup, extractor)))
    }
}

impl std::fmt::Debug for OrderedViewFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.extractors.keys().collect();
        names.sort();
        f.debug_struct("OrderedViewFactory")
            .field("extractors", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{testing, FlexStorage, StorageDriver, StorageSetup, ViewSettings};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        view: OrderedView,
        storage: Arc<StorageQueue>,
        next_seq: u64,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let env = testing::env(256, 32);
            let mut storage = FlexStorage::new(StorageSetup {
                identifier: "docs".into(),
                index: StorageIndex(0),
                path: dir.path().join("docs"),
                env: env.clone(),
            });
            storage.create_storage().unwrap();
            let driver: Arc<dyn StorageDriver> = Arc::new(storage);
            let storage = Arc::new(
                StorageQueue::new("docs", driver, Arc::clone(&env.process)).unwrap(),
            );

            let mut view = OrderedView::new(
                ViewSetup {
                    identifier: "by_body".into(),
                    index: ViewIndex(0),
                    path: dir.path().join("by_body"),
                    env,
                    settings: ViewSettings::new("docs", "raw"),
                    base_index: StorageIndex(0),
                    base: Arc::clone(&storage),
                },
                Arc::new(RawBytes),
            );
            view.create_view().unwrap();

            Self {
                view,
                storage,
                next_seq: 1,
                _dir: dir,
            }
        }

        fn commit(&mut self, mutations: Vec<Mutation>) -> SequenceId {
            let seq = SequenceId::new(self.next_seq);
            self.next_seq += 1;
            self.storage.driver().sequence(seq, &mutations).unwrap();
            self.view.sequence(seq, &mutations).unwrap();
            seq
        }

        fn put(&mut self, doc: u64, body: &str) -> SequenceId {
            self.commit(vec![Mutation::modify(
                StorageIndex(0),
                DocumentId::new(doc),
                body.as_bytes().to_vec(),
            )])
        }

        fn bodies(&self, request: QueryRequest) -> Vec<String> {
            self.view
                .query(&request)
                .unwrap()
                .into_iter()
                .map(|row| String::from_utf8(row.buffer).unwrap())
                .collect()
        }
    }

    #[test]
    fn rows_come_back_in_key_order() {
        let mut fixture = Fixture::new();
        for (doc, body) in [(1, "pear"), (2, "apple"), (3, "fig"), (4, "kiwi")] {
            fixture.put(doc, body);
        }
        assert_eq!(
            fixture.bodies(QueryRequest::new()),
            vec!["apple", "fig", "kiwi", "pear"]
        );
    }

    #[test]
    fn range_and_limit() {
        let mut fixture = Fixture::new();
        for (doc, body) in [(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")] {
            fixture.put(doc, body);
        }
        assert_eq!(
            fixture.bodies(QueryRequest::new().from_key("b").to_key("d")),
            vec!["b", "c", "d"]
        );
        assert_eq!(
            fixture.bodies(QueryRequest::new().from_key("bb").limit(2)),
            vec!["c", "d"]
        );
        assert!(fixture.bodies(QueryRequest::new().from_key("z")).is_empty());
    }

    #[test]
    fn only_newest_visible_version_is_reported() {
        let mut fixture = Fixture::new();
        let first = fixture.put(1, "m-old");
        fixture.put(2, "b");
        fixture.put(1, "a-new");

        assert_eq!(fixture.bodies(QueryRequest::new()), vec!["a-new", "b"]);
        assert_eq!(
            fixture.bodies(QueryRequest::new().at_sequence(first)),
            vec!["m-old"]
        );
        assert_eq!(
            fixture.bodies(QueryRequest::new().at_sequence(SequenceId::new(2))),
            vec!["b", "m-old"]
        );
    }

    #[test]
    fn equal_keys_are_all_reported() {
        let mut fixture = Fixture::new();
        for doc in 1..=30u64 {
            fixture.put(doc, "same");
        }
        let rows = fixture.view.query(&QueryRequest::new()).unwrap();
        assert_eq!(rows.len(), 30);
        let docs: Vec<u64> = rows.iter().map(|r| r.document_id.as_u64()).collect();
        assert_eq!(docs, (1..=30).collect::<Vec<_>>());
    }

    #[test]
    fn other_storages_are_not_indexed() {
        let mut fixture = Fixture::new();
        fixture.commit(vec![Mutation::modify(
            StorageIndex(7),
            DocumentId::new(1),
            b"elsewhere".to_vec(),
        )]);
        assert!(fixture.bodies(QueryRequest::new()).is_empty());
    }

    #[test]
    fn factory_rejects_unknown_extractor() {
        let dir = tempdir().unwrap();
        let env = testing::env(256, 4);
        let storage: Arc<dyn StorageDriver> = Arc::new(FlexStorage::new(StorageSetup {
            identifier: "docs".into(),
            index: StorageIndex(0),
            path: dir.path().join("docs"),
            env: env.clone(),
        }));
        let base = Arc::new(StorageQueue::new("docs", storage, Arc::clone(&env.process)).unwrap());
        let result = OrderedViewFactory::with_builtin().build(ViewSetup {
            identifier: "v".into(),
            index: ViewIndex(0),
            path: dir.path().join("v"),
            env,
            settings: ViewSettings::new("docs", "lua"),
            base_index: StorageIndex(0),
            base,
        });
        assert!(matches!(result, Err(CoreError::DriverNotFound { .. })));
    }
}
