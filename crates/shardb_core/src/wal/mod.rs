//! Write-ahead log.
//!
//! Every coordinator decision that changes durable state is logged before it
//! takes effect: `Submit`, `SubmitCommit`, `Commit` and `Rollback` entries.
//! On startup the log is replayed twice, once to rebuild transaction
//! metadata and once per driver to re-sequence committed mutations.
//!
//! ## Record Format
//!
//! ```text
//! | length (4, LE) | digest (16) | payload (length) |
//! ```
//!
//! The digest is the first 16 bytes of SHA-256 over the payload.
//!
//! ## Recovery Policy
//!
//! - A record whose header or payload runs past end of file is a torn write.
//!   Replay stops before it and the shard truncates it away before logging
//!   anything new.
//! - A digest mismatch or an undecodable payload is fatal: the shard does not
//!   open.
//!
//! ## Durability
//!
//! [`WriteAhead::log`] always flushes the record to the OS. With
//! `sync_on_commit` (the default) it is also fsynced before the coordinator
//! acknowledges the operation.

mod iterator;
mod record;
mod writer;

pub use iterator::WalIterator;
pub use record::{compute_digest, LogEntry, LogEntryType, LogMutation, DIGEST_SIZE};
pub use writer::{ReplaySummary, WriteAhead};

/// Length prefix plus digest.
pub(crate) const HEADER_SIZE: usize = 4 + DIGEST_SIZE;
