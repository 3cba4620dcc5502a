//! # shardb Testkit
//!
//! Test utilities for shardb.
//!
//! This crate provides:
//! - Temporary shards that can be closed and reopened in place
//! - A backend wrapper that injects write failures and torn writes
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shardb_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let mut shard = TestShard::new();
//!     let docs = shard.storage("docs");
//!     let (id, _) = shard.insert(docs, b"hello");
//!     shard.reopen();
//!     assert_eq!(shard.read(docs, id), b"hello");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
