//! Inspect command implementation.

use super::{format_size, open_log};
use serde::Serialize;
use shardb_core::dir::ShardDir;
use shardb_core::wal::{LogEntry, WriteAhead};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Shard inspection result.
#[derive(Debug, Default, Serialize)]
pub struct InspectResult {
    /// Shard path.
    pub path: String,
    /// Log size in bytes.
    pub wal_size: u64,
    /// Intact log entries.
    pub wal_entries: usize,
    /// Bytes after the last intact entry.
    pub torn_bytes: u64,
    /// Entries per type.
    pub entry_counts: EntryCounts,
    /// Sequence id of the last logged commit.
    pub last_sequence_id: u64,
    /// Transactions submitted but neither committed nor rolled back.
    pub pending_transactions: Vec<u64>,
    /// Storages listed in the config.
    pub storages: Vec<StorageInfo>,
    /// Views listed in the config.
    pub views: Vec<ViewInfo>,
}

/// Log entries per type.
#[derive(Debug, Default, Serialize)]
pub struct EntryCounts {
    /// `Submit` entries.
    pub submit: usize,
    /// `SubmitCommit` entries.
    pub submit_commit: usize,
    /// `Commit` entries.
    pub commit: usize,
    /// `Rollback` entries.
    pub rollback: usize,
}

/// One storage of the shard.
#[derive(Debug, Serialize)]
pub struct StorageInfo {
    /// Identifier.
    pub identifier: String,
    /// Driver name from the descriptor.
    pub driver: String,
    /// Bytes used by the driver's files.
    pub disk_size: u64,
}

/// One view of the shard.
#[derive(Debug, Serialize)]
pub struct ViewInfo {
    /// Identifier.
    pub identifier: String,
    /// Driver name from the descriptor.
    pub driver: String,
    /// Storage whose documents are indexed.
    pub base_storage: String,
    /// Key extractor.
    pub extractor: String,
    /// Bytes used by the driver's files.
    pub disk_size: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (dir, wal) = open_log(path)?;
    let result = inspect(&dir, &wal)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

pub(crate) fn inspect(
    dir: &ShardDir,
    wal: &WriteAhead,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut result = InspectResult {
        path: dir.path().display().to_string(),
        wal_size: wal.size()?,
        ..InspectResult::default()
    };

    let mut pending = BTreeSet::new();
    let summary = wal.replay(|_, entry| {
        let counts = &mut result.entry_counts;
        match &entry {
            LogEntry::Submit { txid, .. } => {
                counts.submit += 1;
                pending.insert(txid.as_u64());
            }
            LogEntry::SubmitCommit { .. } => counts.submit_commit += 1,
            LogEntry::Commit { txid, .. } => {
                counts.commit += 1;
                pending.remove(&txid.as_u64());
            }
            LogEntry::Rollback { txid } => {
                counts.rollback += 1;
                pending.remove(&txid.as_u64());
            }
        }
        if let Some(seq) = entry.sequence_id() {
            result.last_sequence_id = result.last_sequence_id.max(seq.as_u64());
        }
        Ok(())
    })?;
    result.wal_entries = summary.records;
    result.torn_bytes = summary.total_size - summary.valid_end;
    result.pending_transactions = pending.into_iter().collect();

    let config = dir.load_config()?;
    for identifier in config.storages {
        let descriptor = dir.load_storage_descriptor(&identifier)?;
        result.storages.push(StorageInfo {
            disk_size: tree_size(&dir.storage_path(&identifier)),
            identifier,
            driver: descriptor.driver,
        });
    }
    for identifier in config.views {
        let descriptor = dir.load_view_descriptor(&identifier)?;
        result.views.push(ViewInfo {
            disk_size: tree_size(&dir.view_path(&identifier)),
            identifier,
            driver: descriptor.driver,
            base_storage: descriptor.settings.base_storage,
            extractor: descriptor.settings.extractor,
        });
    }
    Ok(result)
}

fn tree_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => tree_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

fn print_text_output(result: &InspectResult) {
    println!("shardb Shard Inspection");
    println!("=======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Write-ahead log:");
    println!("  Size:          {}", format_size(result.wal_size));
    println!("  Entries:       {}", result.wal_entries);
    println!("    Submit:        {}", result.entry_counts.submit);
    println!("    SubmitCommit:  {}", result.entry_counts.submit_commit);
    println!("    Commit:        {}", result.entry_counts.commit);
    println!("    Rollback:      {}", result.entry_counts.rollback);
    if result.torn_bytes > 0 {
        println!("  Torn tail:     {} bytes", result.torn_bytes);
    }
    println!("  Last sequence: {}", result.last_sequence_id);
    if !result.pending_transactions.is_empty() {
        println!("  Pending:       {:?}", result.pending_transactions);
    }
    println!();
    println!("Storages:");
    for storage in &result.storages {
        println!(
            "  {} ({}), {}",
            storage.identifier,
            storage.driver,
            format_size(storage.disk_size)
        );
    }
    println!();
    println!("Views:");
    for view in &result.views {
        println!(
            "  {} ({}) over {} by '{}', {}",
            view.identifier,
            view.driver,
            view.base_storage,
            view.extractor,
            format_size(view.disk_size)
        );
    }
}
