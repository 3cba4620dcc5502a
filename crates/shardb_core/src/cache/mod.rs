//! Page cache.
//!
//! All index and data file I/O of a shard goes through a [`PageCache`]. Every
//! cache of a shard registers with one [`CacheHost`], which keeps a single
//! LRU list under a byte budget.
//!
//! ## Page Lifecycle
//!
//! - `read_page` pins a page and schedules its read on the I/O pool if it is
//!   not resident. Other callers for the same page wait for that read.
//! - Writing through a [`PageHandle`] marks the page dirty. No I/O happens.
//! - When the host drops a page from its list, the page is flagged for
//!   release. Once unpinned it is written back (if dirty) and evicted.
//! - Pinning a flagged page again clears the flag and relists it.

mod host;
mod page_cache;
mod random_access;

pub use host::{CacheHost, Cacheable};
pub use page_cache::{PageCache, PageHandle, PageNumber, PageWrite};
pub use random_access::RandomAccessFile;
