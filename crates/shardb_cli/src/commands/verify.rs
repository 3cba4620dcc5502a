//! Verify command implementation.

use super::{open_log, CliError};
use shardb_core::dir::ShardDir;
use shardb_core::wal::{LogEntry, WriteAhead};
use shardb_core::{Config, DriverRegistry, Shard};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of log records checked.
    pub records_checked: usize,
    /// Problems that keep the shard from opening or indicate a damaged log.
    pub errors: Vec<String>,
    /// Findings the shard repairs by itself on open.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, open: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying shard at {}", path.display());
    println!();

    let mut result = {
        let (dir, wal) = open_log(path)?;
        println!("Checking write-ahead log...");
        let mut result = verify_log(&wal)?;
        println!("Checking descriptors...");
        verify_descriptors(&dir, &DriverRegistry::with_builtin(), &mut result);
        result
    };

    if open && result.is_ok() {
        // The lock taken above is released, so the shard can take it.
        println!("Opening shard...");
        if let Err(err) = Shard::open(
            path,
            Config::new().create_if_missing(false),
            DriverRegistry::with_builtin(),
        ) {
            result.errors.push(format!("open failed: {err}"));
        }
    }

    print_result(&result);
    println!();
    if result.is_ok() {
        println!("✓ Shard verification passed");
        Ok(())
    } else {
        println!("✗ Shard verification failed");
        Err(CliError::VerificationFailed(result.errors.len()).into())
    }
}

/// Replays the log and checks transaction ordering.
pub(crate) fn verify_log(wal: &WriteAhead) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let mut submitted = HashSet::new();
    let mut seen = HashSet::new();
    let mut last_sequence = 0u64;

    let mut iter = wal.iter()?;
    for item in iter.by_ref() {
        let (offset, entry) = match item {
            Ok(item) => item,
            Err(err) => {
                result.errors.push(err.to_string());
                break;
            }
        };
        result.records_checked += 1;

        let txid = entry.txid();
        match &entry {
            LogEntry::Submit { .. } | LogEntry::SubmitCommit { .. } => {
                if !seen.insert(txid) {
                    result
                        .errors
                        .push(format!("{txid} submitted twice (offset {offset})"));
                }
                if matches!(entry, LogEntry::Submit { .. }) {
                    submitted.insert(txid);
                }
            }
            LogEntry::Commit { .. } | LogEntry::Rollback { .. } => {
                if !submitted.remove(&txid) {
                    result.errors.push(format!(
                        "{:?} of {txid} without a pending submit (offset {offset})",
                        entry.entry_type()
                    ));
                }
            }
        }

        if let Some(seq) = entry.sequence_id() {
            if seq.as_u64() != last_sequence + 1 {
                result.errors.push(format!(
                    "{seq} at offset {offset} does not follow seq:{last_sequence}"
                ));
            }
            last_sequence = seq.as_u64();
        }
    }

    if iter.valid_end() < iter.total_size() {
        result.warnings.push(format!(
            "torn tail of {} bytes at offset {}, discarded on next open",
            iter.total_size() - iter.valid_end(),
            iter.valid_end()
        ));
    }
    if !submitted.is_empty() {
        result.warnings.push(format!(
            "{} submitted transaction(s) awaiting commit or rollback",
            submitted.len()
        ));
    }
    Ok(result)
}

/// Checks that the config and every descriptor decode and name known drivers.
pub(crate) fn verify_descriptors(
    dir: &ShardDir,
    registry: &DriverRegistry,
    result: &mut VerifyResult,
) {
    let config = match dir.load_config() {
        Ok(config) => config,
        Err(err) => {
            result.errors.push(format!("config: {err}"));
            return;
        }
    };

    for identifier in &config.storages {
        match dir.load_storage_descriptor(identifier) {
            Ok(descriptor) => {
                if let Err(err) = registry.storage(&descriptor.driver) {
                    result.errors.push(format!("storage '{identifier}': {err}"));
                }
            }
            Err(err) => result.errors.push(format!("storage '{identifier}': {err}")),
        }
    }
    for identifier in &config.views {
        match dir.load_view_descriptor(identifier) {
            Ok(descriptor) => {
                if let Err(err) = registry.view(&descriptor.driver) {
                    result.errors.push(format!("view '{identifier}': {err}"));
                }
                if !config.storages.contains(&descriptor.settings.base_storage) {
                    result.errors.push(format!(
                        "view '{identifier}': base storage '{}' is not in the config",
                        descriptor.settings.base_storage
                    ));
                }
            }
            Err(err) => result.errors.push(format!("view '{identifier}': {err}")),
        }
    }
}

fn print_result(result: &VerifyResult) {
    println!();
    println!("  Records checked: {}", result.records_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_shard;
    use shardb_core::{SequenceId, TransactionId};
    use shardb_storage::InMemoryBackend;
    use std::fs;

    fn log_of(entries: &[LogEntry]) -> WriteAhead {
        let wal = WriteAhead::new(Box::new(InMemoryBackend::new()), false);
        for entry in entries {
            wal.log(entry).unwrap();
        }
        wal
    }

    #[test]
    fn sample_shard_passes() {
        let dir = tempfile::tempdir().unwrap();
        sample_shard(dir.path());

        let (shard_dir, wal) = open_log(dir.path()).unwrap();
        let mut result = verify_log(&wal).unwrap();
        verify_descriptors(&shard_dir, &DriverRegistry::with_builtin(), &mut result);

        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 3);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn ordering_problems_are_reported() {
        let tx = TransactionId::new(1);
        let wal = log_of(&[
            LogEntry::Commit {
                txid: tx,
                sequence_id: SequenceId::new(1),
            },
            LogEntry::SubmitCommit {
                txid: TransactionId::new(2),
                sequence_id: SequenceId::new(5),
                mutations: Vec::new(),
            },
            LogEntry::SubmitCommit {
                txid: TransactionId::new(2),
                sequence_id: SequenceId::new(6),
                mutations: Vec::new(),
            },
        ]);

        let result = verify_log(&wal).unwrap();
        assert_eq!(result.records_checked, 3);
        assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
        assert!(result.errors[0].contains("without a pending submit"));
        assert!(result.errors[1].contains("does not follow"));
        assert!(result.errors[2].contains("submitted twice"));
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        sample_shard(dir.path());
        let wal_path = dir.path().join("transact.wal");
        let mut bytes = fs::read(&wal_path).unwrap();
        bytes[20] ^= 0xFF;
        fs::write(&wal_path, &bytes).unwrap();

        let (_shard_dir, wal) = open_log(dir.path()).unwrap();
        let result = verify_log(&wal).unwrap();
        assert_eq!(result.records_checked, 0);
        assert!(result.errors[0].contains("digest mismatch"));
    }

    #[test]
    fn unknown_driver_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        sample_shard(dir.path());

        let (shard_dir, _wal) = open_log(dir.path()).unwrap();
        let mut result = VerifyResult::default();
        verify_descriptors(&shard_dir, &DriverRegistry::new(), &mut result);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn run_with_open_rebuilds_drivers() {
        let dir = tempfile::tempdir().unwrap();
        sample_shard(dir.path());
        run(dir.path(), true).unwrap();
    }
}
