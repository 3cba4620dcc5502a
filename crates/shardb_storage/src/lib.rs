//! # shardb storage
//!
//! Byte-store backends underneath a shardb shard.
//!
//! A backend is an **opaque byte store**: it knows nothing about WAL records,
//! B-tree blocks or documents. Two access patterns are supported:
//!
//! - append-only writes, used by the write-ahead log
//! - positional writes, used by page files that are rewritten in place
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and throwaway shards
//! - [`FileBackend`] - Persistent storage on top of OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use shardb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(4, b"page").unwrap();
//! assert_eq!(backend.size().unwrap(), 8);
//! assert_eq!(backend.read_at(0, 8).unwrap(), b"\0\0\0\0page");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
