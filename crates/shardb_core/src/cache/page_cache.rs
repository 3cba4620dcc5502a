//! Page table, pinning and write-back for one file.

use crate::cache::host::{CacheHost, CacheKey, Cacheable};
use crate::error::{CoreError, CoreResult};
use crate::tasks::TaskPool;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shardb_storage::StorageBackend;
use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// Index of a page within its file.
pub type PageNumber = u64;

struct PageState {
    /// Pins, including callers still waiting for the load.
    use_count: usize,
    loaded: bool,
    dirty: bool,
    /// Present in the host LRU list.
    listed: bool,
    /// The host let go of the page; evict once `use_count` drops to zero.
    release: bool,
    failed: Option<String>,
}

struct PageInfo {
    number: PageNumber,
    cache: Weak<CacheInner>,
    footprint: u64,
    state: Mutex<PageState>,
    ready: Condvar,
    buffer: RwLock<Vec<u8>>,
}

impl PageInfo {
    fn new(number: PageNumber, cache: Weak<CacheInner>, page_size: usize, initialize: bool) -> Self {
        Self {
            number,
            cache,
            footprint: page_size as u64,
            state: Mutex::new(PageState {
                use_count: 1,
                loaded: initialize,
                dirty: initialize,
                listed: true,
                release: false,
                failed: None,
            }),
            ready: Condvar::new(),
            buffer: RwLock::new(vec![0; page_size]),
        }
    }
}

impl Cacheable for PageInfo {
    fn footprint(&self) -> u64 {
        self.footprint
    }

    fn release(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.begin_release(self);
        }
    }
}

enum Admission {
    Listed,
    Relist,
    Load,
}

// Lock order: backend, table, page state, host. Page buffers are only
// ever locked with nothing held or right before the page state.
struct CacheInner {
    id: u32,
    host: Arc<CacheHost>,
    io: Arc<TaskPool>,
    backend: Mutex<Box<dyn StorageBackend>>,
    page_size: usize,
    table: Mutex<HashMap<PageNumber, Arc<PageInfo>>>,
}

impl CacheInner {
    fn key(&self, number: PageNumber) -> CacheKey {
        (self.id, number)
    }

    fn pin(self: &Arc<Self>, number: PageNumber, initialize: bool) -> CoreResult<PageHandle> {
        let (page, admission) = {
            let mut table = self.table.lock();
            if let Some(page) = table.get(&number) {
                let page = Arc::clone(page);
                let relist = {
                    let mut state = page.state.lock();
                    state.use_count += 1;
                    state.release = false;
                    let relist = !state.listed;
                    state.listed = true;
                    relist
                };
                let admission = if relist {
                    Admission::Relist
                } else {
                    Admission::Listed
                };
                (page, admission)
            } else {
                let page = Arc::new(PageInfo::new(
                    number,
                    Arc::downgrade(self),
                    self.page_size,
                    initialize,
                ));
                table.insert(number, Arc::clone(&page));
                (page, Admission::Load)
            }
        };

        let key = self.key(number);
        match admission {
            Admission::Listed => self.host.on_access(key),
            Admission::Relist => self.host.request_acquire(key, page.clone()),
            Admission::Load => {
                self.host.request_acquire(key, page.clone());
                if !initialize {
                    let inner = Arc::clone(self);
                    let loading = Arc::clone(&page);
                    self.io.submit(move || inner.load(&loading));
                }
            }
        }

        {
            let mut state = page.state.lock();
            while !state.loaded && state.failed.is_none() {
                page.ready.wait(&mut state);
            }
            if let Some(message) = &state.failed {
                let err = CoreError::Io(io::Error::new(io::ErrorKind::Other, message.clone()));
                state.use_count -= 1;
                return Err(err);
            }
        }

        let handle = PageHandle {
            page,
            cache: Arc::clone(self),
        };
        if initialize {
            handle.write().fill(0);
        }
        Ok(handle)
    }

    fn read_from_disk(&self, number: PageNumber) -> CoreResult<Vec<u8>> {
        let offset = number * self.page_size as u64;
        let mut buffer = vec![0; self.page_size];
        let backend = self.backend.lock();
        let size = backend.size()?;
        if offset < size {
            let available = (size - offset).min(self.page_size as u64) as usize;
            let bytes = backend.read_at(offset, available)?;
            buffer[..available].copy_from_slice(&bytes);
        }
        Ok(buffer)
    }

    fn load(&self, page: &Arc<PageInfo>) {
        match self.read_from_disk(page.number) {
            Ok(bytes) => {
                *page.buffer.write() = bytes;
                let mut state = page.state.lock();
                state.loaded = true;
                page.ready.notify_all();
            }
            Err(err) => {
                tracing::warn!(page = page.number, error = %err, "page load failed");
                let mut table = self.table.lock();
                if table
                    .get(&page.number)
                    .is_some_and(|entry| Arc::ptr_eq(entry, page))
                {
                    table.remove(&page.number);
                }
                let mut state = page.state.lock();
                state.failed = Some(err.to_string());
                state.listed = false;
                page.ready.notify_all();
                self.host.forget(self.key(page.number));
            }
        }
    }

    fn begin_release(self: &Arc<Self>, released: &PageInfo) {
        let page = {
            let table = self.table.lock();
            let Some(entry) = table.get(&released.number) else {
                return;
            };
            if !std::ptr::eq(Arc::as_ptr(entry), released) {
                return;
            }
            let page = Arc::clone(entry);
            let mut state = page.state.lock();
            state.listed = false;
            state.release = true;
            if state.use_count > 0 {
                tracing::trace!(page = page.number, "eviction deferred while pinned");
                return;
            }
            drop(state);
            page
        };
        self.schedule_release(page);
    }

    fn release_page(self: &Arc<Self>, page: &Arc<PageInfo>) {
        let evict = {
            let mut state = page.state.lock();
            state.use_count -= 1;
            state.use_count == 0 && state.release
        };
        if evict {
            self.schedule_release(Arc::clone(page));
        }
    }

    fn schedule_release(self: &Arc<Self>, page: Arc<PageInfo>) {
        if page.state.lock().dirty {
            let inner = Arc::clone(self);
            self.io.submit(move || inner.finish_release(&page));
        } else {
            self.finish_release(&page);
        }
    }

    fn finish_release(&self, page: &Arc<PageInfo>) {
        if let Err(err) = self.write_back(page) {
            tracing::warn!(
                page = page.number,
                error = %err,
                "write-back failed, page stays resident"
            );
            let relist = {
                let mut state = page.state.lock();
                state.release = false;
                let relist = !state.listed;
                state.listed = true;
                relist
            };
            // Back under the budget; the next eviction retries the write.
            if relist {
                self.host.restore(self.key(page.number), page.clone());
            }
            return;
        }

        let mut table = self.table.lock();
        let state = page.state.lock();
        if state.use_count > 0 || !state.release || state.dirty {
            return;
        }
        if table
            .get(&page.number)
            .is_some_and(|entry| Arc::ptr_eq(entry, page))
        {
            table.remove(&page.number);
            tracing::trace!(page = page.number, "page evicted");
        }
    }

    fn write_back(&self, page: &PageInfo) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        {
            let mut state = page.state.lock();
            if !state.dirty || !state.loaded {
                return Ok(());
            }
            state.dirty = false;
        }
        let snapshot = page.buffer.read().clone();
        if let Err(err) = backend.write_at(page.number * self.page_size as u64, &snapshot) {
            page.state.lock().dirty = true;
            return Err(err.into());
        }
        Ok(())
    }
}

/// A cache of fixed-size pages over one backend.
///
/// Pages are read on the I/O pool, pinned by [`PageHandle`]s and written
/// back when the shared [`CacheHost`] evicts them or on [`PageCache::flush`].
/// A pinned page is never evicted; if the host lets go of it while pinned,
/// eviction happens when the last handle drops.
pub struct PageCache {
    inner: Arc<CacheInner>,
}

impl PageCache {
    /// Opens a cache over `backend` with pages of `page_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `page_size` is zero.
    pub fn open(
        host: Arc<CacheHost>,
        io: Arc<TaskPool>,
        backend: Box<dyn StorageBackend>,
        page_size: usize,
    ) -> CoreResult<Self> {
        if page_size == 0 {
            return Err(CoreError::invalid_config("page size must be positive"));
        }
        let id = host.register();
        Ok(Self {
            inner: Arc::new(CacheInner {
                id,
                host,
                io,
                backend: Mutex::new(backend),
                page_size,
                table: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Pins a page, reading it from disk unless it is resident.
    ///
    /// Concurrent callers for a page that is still loading wait for the
    /// same read. Pages past the end of the file read as zeros.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_page(&self, number: PageNumber) -> CoreResult<PageHandle> {
        self.inner.pin(number, false)
    }

    /// Pins a zeroed, dirty page without reading the disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a load of the same page, already in flight,
    /// fails.
    pub fn initialize_page(&self, number: PageNumber) -> CoreResult<PageHandle> {
        self.inner.pin(number, true)
    }

    /// Writes every dirty resident page back and flushes the backend.
    ///
    /// # Errors
    ///
    /// Returns the first write error; the affected page stays dirty.
    pub fn flush(&self) -> CoreResult<()> {
        let pages: Vec<Arc<PageInfo>> = self.inner.table.lock().values().cloned().collect();
        for page in pages {
            self.inner.write_back(&page)?;
        }
        self.inner.backend.lock().flush()?;
        Ok(())
    }

    /// Size of one page.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Number of pages in the page table.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Whether `number` is in the page table.
    #[must_use]
    pub fn is_resident(&self, number: PageNumber) -> bool {
        self.inner.table.lock().contains_key(&number)
    }

    /// Size of the backing file, not counting unwritten dirty pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn file_size(&self) -> CoreResult<u64> {
        Ok(self.inner.backend.lock().size()?)
    }

    /// The host this cache is budgeted under.
    #[must_use]
    pub fn host(&self) -> &Arc<CacheHost> {
        &self.inner.host
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(error = %err, "flushing page cache on close failed");
        }
        self.inner.host.forget_cache(self.inner.id);
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("id", &self.inner.id)
            .field("page_size", &self.inner.page_size)
            .field("resident_pages", &self.resident_pages())
            .finish()
    }
}

/// A pinned page. Dropping the handle releases the pin.
pub struct PageHandle {
    page: Arc<PageInfo>,
    cache: Arc<CacheInner>,
}

impl PageHandle {
    /// The page number.
    #[must_use]
    pub fn number(&self) -> PageNumber {
        self.page.number
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.page.buffer.read()
    }

    /// Exclusive access to the page bytes; the page is marked dirty when the
    /// guard drops.
    pub fn write(&self) -> PageWrite<'_> {
        PageWrite {
            guard: self.page.buffer.write(),
            page: &self.page,
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cache.release_page(&self.page);
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("number", &self.page.number)
            .finish()
    }
}

/// Write guard over a page buffer.
pub struct PageWrite<'a> {
    guard: RwLockWriteGuard<'a, Vec<u8>>,
    page: &'a PageInfo,
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        // Still holding the buffer, so a concurrent write-back that clears
        // the flag copies these bytes.
        self.page.state.lock().dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardb_storage::{FileBackend, InMemoryBackend, StorageError, StorageResult};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn io_pool() -> Arc<TaskPool> {
        Arc::new(TaskPool::new("test-io", 2).unwrap())
    }

    fn memory_cache(pages_budget: u64) -> PageCache {
        let host = Arc::new(CacheHost::new(pages_budget * PAGE as u64));
        PageCache::open(host, io_pool(), Box::new(InMemoryBackend::new()), PAGE).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn pages_past_end_read_as_zeros() {
        let cache = memory_cache(4);
        let page = cache.read_page(10).unwrap();
        assert_eq!(page.read().len(), PAGE);
        assert!(page.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages");
        let host = Arc::new(CacheHost::new(16 * PAGE as u64));
        let io = io_pool();

        {
            let cache = PageCache::open(
                Arc::clone(&host),
                Arc::clone(&io),
                Box::new(FileBackend::create(&path).unwrap()),
                PAGE,
            )
            .unwrap();
            let page = cache.initialize_page(2).unwrap();
            page.write()[..5].copy_from_slice(b"hello");
            drop(page);
            cache.flush().unwrap();
        }

        let cache = PageCache::open(
            host,
            io,
            Box::new(FileBackend::open(&path).unwrap()),
            PAGE,
        )
        .unwrap();
        assert_eq!(cache.file_size().unwrap(), 3 * PAGE as u64);
        assert_eq!(&cache.read_page(2).unwrap().read()[..5], b"hello");
        assert!(cache.read_page(0).unwrap().read().iter().all(|&b| b == 0));
    }

    #[test]
    fn evicted_dirty_pages_are_written_back() {
        let cache = memory_cache(2);
        for n in 0..8u64 {
            let page = cache.initialize_page(n).unwrap();
            page.write()[0] = n as u8 + 1;
        }

        assert!(wait_until(|| cache.resident_pages() <= 2));
        for n in 0..8u64 {
            assert_eq!(cache.read_page(n).unwrap().read()[0], n as u8 + 1);
        }
        assert!(cache.host().footprint() <= 2 * PAGE as u64);
    }

    #[test]
    fn pinned_page_survives_pressure_until_released() {
        let cache = memory_cache(2);
        let pins: Vec<_> = (0..3).map(|_| cache.read_page(0).unwrap()).collect();
        pins[0].write()[0] = 42;

        for n in 1..10u64 {
            drop(cache.read_page(n).unwrap());
        }
        assert!(cache.is_resident(0));

        let mut pins = pins;
        let last = pins.pop().unwrap();
        drop(pins);
        for n in 10..20u64 {
            drop(cache.read_page(n).unwrap());
        }
        assert!(cache.is_resident(0));
        assert_eq!(last.read()[0], 42);

        drop(last);
        assert!(wait_until(|| !cache.is_resident(0)));
        assert_eq!(cache.read_page(0).unwrap().read()[0], 42);
    }

    #[test]
    fn concurrent_readers_share_one_page() {
        let cache = Arc::new(memory_cache(8));
        {
            let page = cache.initialize_page(3).unwrap();
            page.write().fill(7);
        }

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.read_page(3).unwrap().read().iter().all(|&b| b == 7))
            })
            .collect();
        for reader in readers {
            assert!(reader.join().unwrap());
        }
        assert_eq!(cache.resident_pages(), 1);
    }

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn read_at(&self, _offset: u64, _len: usize) -> StorageResult<Vec<u8>> {
            Err(StorageError::Closed)
        }
        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> StorageResult<()> {
            Err(StorageError::Closed)
        }
        fn append(&mut self, _data: &[u8]) -> StorageResult<u64> {
            Err(StorageError::Closed)
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            Ok(1 << 20)
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn truncate(&mut self, _size: u64) -> StorageResult<()> {
            Err(StorageError::Closed)
        }
    }

    #[test]
    fn load_failure_is_reported_and_not_cached() {
        let host = Arc::new(CacheHost::new(4 * PAGE as u64));
        let cache = PageCache::open(Arc::clone(&host), io_pool(), Box::new(BrokenBackend), PAGE)
            .unwrap();

        assert!(cache.read_page(1).is_err());
        assert!(!cache.is_resident(1));
        assert_eq!(host.footprint(), 0);
        assert!(cache.read_page(1).is_err());
    }

    #[test]
    fn failed_write_back_keeps_page_dirty() {
        let host = Arc::new(CacheHost::new(4 * PAGE as u64));
        let cache = PageCache::open(host, io_pool(), Box::new(BrokenBackend), PAGE).unwrap();
        let page = cache.initialize_page(0).unwrap();
        page.write()[0] = 1;
        drop(page);

        assert!(cache.flush().is_err());
        assert!(cache.is_resident(0));
        assert!(cache.flush().is_err());
    }

    #[test]
    fn failed_eviction_stays_under_the_budget() {
        let host = Arc::new(CacheHost::new(PAGE as u64));
        let cache = PageCache::open(Arc::clone(&host), io_pool(), Box::new(BrokenBackend), PAGE)
            .unwrap();
        drop(cache.initialize_page(0).unwrap());
        drop(cache.initialize_page(1).unwrap());

        assert!(wait_until(|| host.len() == 2));
        assert!(cache.is_resident(0));
        assert_eq!(host.footprint(), 2 * PAGE as u64);

        let evictions = host.evictions();
        drop(cache.initialize_page(2).unwrap());
        assert!(host.evictions() >= evictions + 2);
        assert!(wait_until(|| host.len() == 3));
        assert_eq!(cache.resident_pages(), 3);
    }
}
