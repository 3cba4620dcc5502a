//! # shardb core
//!
//! The transactional engine of one shard.
//!
//! This crate provides:
//! - a write-ahead log with digest-checked records and torn-tail recovery
//! - a page cache whose pages share one memory budget per shard
//! - an on-disk B-tree with pluggable key codecs and cursors
//! - storage and view drivers (`FlexStorage`, `OrderedView`) behind
//!   request/sequence queues
//! - the transaction engine: optimistic conflict checks, gap-free sequence
//!   ids, crash recovery by log replay
//!
//! ## Example
//!
//! ```rust,ignore
//! use shardb_core::{Config, DriverRegistry, Mutation, Shard, FLEX_STORAGE};
//!
//! let shard = Shard::open(path, Config::default(), DriverRegistry::with_builtin())?;
//! let docs = match shard.storage("docs") {
//!     Some(docs) => docs,
//!     None => shard.create_storage(FLEX_STORAGE, "docs")?,
//! };
//!
//! let tx = shard.transaction()?;
//! let id = shard.update_mutation(tx, Mutation::insert(docs, b"hello".to_vec()))?;
//! shard.submit_commit(tx)?.wait()?;
//! assert_eq!(shard.fetch(docs, id, None)?.wait()?.buffer, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
pub mod cache;
mod config;
pub mod descriptor;
pub mod dir;
pub mod driver;
mod engine;
mod error;
mod mutation;
mod shard;
pub mod tasks;
mod types;
pub mod wal;

pub use config::Config;
pub use driver::{
    Document, DriverRegistry, FetchRequest, KeyExtractor, QueryRequest, QueryRow, Sequenceable,
    StorageDriver, StorageFactory, ViewDriver, ViewFactory, ViewSettings, FLEX_STORAGE,
    ORDERED_VIEW,
};
pub use engine::{Engine, TransactionState};
pub use error::{CoreError, CoreResult, FetchError, QueryError, SubmitError};
pub use mutation::{compatible, Constraint, ConstraintKind, Mutation, MutationKind};
pub use shard::Shard;
pub use tasks::{Pending, Resolver, TaskPool};
pub use types::{DocumentId, SequenceId, StorageIndex, TransactionId, ViewIndex};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
