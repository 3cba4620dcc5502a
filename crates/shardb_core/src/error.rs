//! Error types for shardb core.

use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in shardb core operations.
///
/// Some variants mean the shard is no longer trustworthy; see
/// [`CoreError::is_fatal`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] shardb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write-ahead log failed its digest check or could not be decoded.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// No active transaction has this id.
    #[error("illegal transaction {id}")]
    IllegalTransaction {
        /// The unknown transaction.
        id: TransactionId,
    },

    /// The transaction is not in a state that permits the operation.
    #[error("cannot {operation} {id} in state {state}")]
    IllegalState {
        /// The transaction.
        id: TransactionId,
        /// Name of the rejected operation.
        operation: &'static str,
        /// Name of the state the transaction was in.
        state: &'static str,
    },

    /// An on-disk structure broke one of its invariants.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// What went wrong.
        message: String,
    },

    /// No factory is registered under this driver name.
    #[error("driver '{name}' not available")]
    DriverNotFound {
        /// The requested driver name.
        name: String,
    },

    /// No storage or view is set up under this identifier or index.
    #[error("unknown storage or view: {identifier}")]
    UnknownTarget {
        /// The identifier or index that failed to resolve.
        identifier: String,
    },

    /// A storage or view with this identifier exists already.
    #[error("'{identifier}' exists already")]
    AlreadyExists {
        /// The conflicting identifier.
        identifier: String,
    },

    /// A storage cannot be unlinked while a view is built on it.
    #[error("'{identifier}' is in use by '{user}'")]
    InUse {
        /// The storage.
        identifier: String,
        /// The view that depends on it.
        user: String,
    },

    /// Another process holds the shard directory lock.
    #[error("shard locked: another process has exclusive access")]
    ShardLocked,

    /// A config, descriptor or B-tree head could not be parsed.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Configuration values that cannot work together.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A WAL write failed earlier; the shard refuses further work.
    #[error("shard failed: {reason}")]
    ShardFailed {
        /// The original failure.
        reason: String,
    },

    /// The producing side of a completion went away without answering.
    #[error("completion dropped before a result was delivered")]
    Disconnected,
}

impl CoreError {
    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a driver-not-found error.
    pub fn driver_not_found(name: impl Into<String>) -> Self {
        Self::DriverNotFound { name: name.into() }
    }

    /// Creates an unknown-target error.
    pub fn unknown_target(identifier: impl ToString) -> Self {
        Self::UnknownTarget {
            identifier: identifier.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(identifier: impl Into<String>) -> Self {
        Self::AlreadyExists {
            identifier: identifier.into(),
        }
    }

    /// Creates a shard failed error.
    pub fn shard_failed(reason: impl Into<String>) -> Self {
        Self::ShardFailed {
            reason: reason.into(),
        }
    }

    /// Returns true for errors that indicate a bug or a broken shard rather
    /// than a condition the caller can retry around.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WalCorruption { .. }
                | Self::IllegalTransaction { .. }
                | Self::IllegalState { .. }
                | Self::InvariantViolation { .. }
                | Self::ShardFailed { .. }
        )
    }
}

/// Why a submit was refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// One of our constraints collides with a mutation of another submitted
    /// transaction.
    #[error("constraint conflicts with a pending transaction")]
    ConstraintConflict,

    /// One of our mutations collides with a constraint of another submitted
    /// transaction.
    #[error("mutation conflicts with a pending transaction")]
    MutationConflict,

    /// A constraint does not hold against committed state.
    #[error("constraint violated by committed state")]
    ConstraintViolation,

    /// Reading committed state or writing the log failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Why a fetch produced no document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No version of the document is visible at the requested sequence id.
    #[error("document not found")]
    DocumentNotFound,

    /// Reading the index or data file failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Why a view query failed.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Reading the view or its base storage failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(CoreError::wal_corruption("bad digest").is_fatal());
        assert!(CoreError::IllegalTransaction {
            id: TransactionId::new(7)
        }
        .is_fatal());
        assert!(!CoreError::Disconnected.is_fatal());
        assert!(!CoreError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_fatal());
    }

    #[test]
    fn io_errors_surface_as_storage_variants() {
        let io = CoreError::Io(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(matches!(SubmitError::from(io), SubmitError::Storage(_)));

        let fetch: FetchError = CoreError::Disconnected.into();
        assert!(matches!(fetch, FetchError::Storage(CoreError::Disconnected)));
    }

    #[test]
    fn illegal_state_message() {
        let err = CoreError::IllegalState {
            id: TransactionId::new(3),
            operation: "commit",
            state: "Open",
        };
        assert_eq!(err.to_string(), "cannot commit txn:3 in state Open");
    }
}
