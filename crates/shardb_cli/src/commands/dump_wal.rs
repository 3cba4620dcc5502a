//! Dump WAL command implementation.

use super::open_log;
use serde::Serialize;
use shardb_core::wal::{LogEntry, LogMutation, WriteAhead};
use shardb_core::MutationKind;
use std::path::Path;

/// One dumped log entry.
#[derive(Debug, Serialize)]
pub struct EntryDump {
    /// Offset of the record in the log.
    pub offset: u64,
    /// Entry type name.
    pub entry_type: String,
    /// Transaction ID.
    pub txid: u64,
    /// Sequence id, for `SubmitCommit` and `Commit`.
    pub sequence_id: Option<u64>,
    /// Mutations, for `Submit` and `SubmitCommit`.
    pub mutations: Vec<MutationDump>,
}

/// One mutation of a dumped entry.
#[derive(Debug, Serialize)]
pub struct MutationDump {
    /// `insert` or `modify`.
    pub kind: &'static str,
    /// Target storage identifier.
    pub storage: String,
    /// Target document.
    pub document_id: u64,
    /// Buffer length in bytes.
    pub length: usize,
}

impl From<&LogMutation> for MutationDump {
    fn from(mutation: &LogMutation) -> Self {
        Self {
            kind: match mutation.kind {
                MutationKind::Insert => "insert",
                MutationKind::Modify => "modify",
            },
            storage: mutation.storage.clone(),
            document_id: mutation.document_id.as_u64(),
            length: mutation.buffer.len(),
        }
    }
}

impl EntryDump {
    fn new(offset: u64, entry: &LogEntry) -> Self {
        Self {
            offset,
            entry_type: format!("{:?}", entry.entry_type()),
            txid: entry.txid().as_u64(),
            sequence_id: entry.sequence_id().map(|seq| seq.as_u64()),
            mutations: entry
                .mutations()
                .unwrap_or_default()
                .iter()
                .map(MutationDump::from)
                .collect(),
        }
    }
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, wal) = open_log(path)?;
    let entries = collect(&wal, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries),
    }
    Ok(())
}

/// Reads up to `limit` entries from the start of the log.
pub(crate) fn collect(
    wal: &WriteAhead,
    limit: Option<usize>,
) -> Result<Vec<EntryDump>, Box<dyn std::error::Error>> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    for item in wal.iter()?.take(limit) {
        let (offset, entry) = item?;
        entries.push(EntryDump::new(offset, &entry));
    }
    Ok(entries)
}

fn print_text_output(entries: &[EntryDump]) {
    println!("Write-Ahead Log Dump");
    println!("====================");
    println!();

    for entry in entries {
        print!("[{:>8}] {:<12} txn:{}", entry.offset, entry.entry_type, entry.txid);
        if let Some(seq) = entry.sequence_id {
            print!(" seq:{seq}");
        }
        println!();
        for mutation in &entry.mutations {
            println!(
                "             {} {} doc:{} ({} bytes)",
                mutation.kind, mutation.storage, mutation.document_id, mutation.length
            );
        }
    }

    println!();
    println!("Total entries: {}", entries.len());
}
