//! Byte-granular access through a page cache.

use crate::cache::PageCache;
use crate::error::CoreResult;

/// Reads and writes arbitrary byte ranges of a paged file.
///
/// Ranges may span pages; each touched page is pinned only while it is
/// copied.
#[derive(Debug)]
pub struct RandomAccessFile {
    cache: PageCache,
}

impl RandomAccessFile {
    /// Wraps a page cache.
    #[must_use]
    pub fn new(cache: PageCache) -> Self {
        Self { cache }
    }

    /// Reads `len` bytes at `offset`. Bytes never written read as zeros.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be loaded.
    pub fn read(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let page_size = self.cache.page_size() as u64;
        let mut out = Vec::with_capacity(len);
        let mut position = offset;
        let end = offset + len as u64;

        while position < end {
            let page = self.cache.read_page(position / page_size)?;
            let start = (position % page_size) as usize;
            let take = ((page_size - start as u64).min(end - position)) as usize;
            out.extend_from_slice(&page.read()[start..start + take]);
            position += take as u64;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be loaded.
    pub fn write(&self, offset: u64, data: &[u8]) -> CoreResult<()> {
        let page_size = self.cache.page_size() as u64;
        let mut written = 0usize;

        while written < data.len() {
            let position = offset + written as u64;
            let start = (position % page_size) as usize;
            let take = (page_size as usize - start).min(data.len() - written);
            let page = if start == 0 && take == page_size as usize {
                self.cache.initialize_page(position / page_size)?
            } else {
                self.cache.read_page(position / page_size)?
            };
            page.write()[start..start + take].copy_from_slice(&data[written..written + take]);
            written += take;
        }
        Ok(())
    }

    /// Writes all dirty pages back.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.cache.flush()
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }
}
