//! CLI command implementations.

pub mod dump_wal;
pub mod inspect;
pub mod verify;

use shardb_core::dir::ShardDir;
use shardb_core::wal::WriteAhead;
use shardb_storage::FileBackend;
use std::path::Path;
use thiserror::Error;

/// Failures reported by the commands themselves.
#[derive(Debug, Error)]
pub enum CliError {
    /// No shard config in the directory.
    #[error("no shard found at {0}")]
    NoShard(String),

    /// `verify` found problems.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),
}

/// Locks the shard directory and opens its log for reading.
pub(crate) fn open_log(
    path: &Path,
) -> Result<(ShardDir, WriteAhead), Box<dyn std::error::Error>> {
    let dir = ShardDir::open(path, false)?;
    if !dir.has_config() {
        return Err(CliError::NoShard(path.display().to_string()).into());
    }
    let backend = FileBackend::open(&dir.wal_path())?;
    Ok((dir, WriteAhead::new(Box::new(backend), false)))
}

/// Human-readable byte count.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_log(dir.path()).err().unwrap();
        assert!(err.to_string().contains("no shard found"));
    }
}
