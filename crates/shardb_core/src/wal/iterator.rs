//! Streaming reader over log records.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_digest, LogEntry, DIGEST_SIZE};
use crate::wal::HEADER_SIZE;
use parking_lot::MutexGuard;
use shardb_storage::StorageBackend;

/// Reads log records one at a time, in file order.
///
/// Holds the backend lock for its whole lifetime, so no record can be
/// appended while a replay is in progress.
///
/// - A record whose declared length runs past the end of the file is a torn
///   write: iteration stops cleanly and [`WalIterator::valid_end`] reports
///   where the intact prefix ends.
/// - A digest mismatch or an undecodable payload is fatal.
pub struct WalIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalIterator<'a> {
    pub(crate) fn new(backend: MutexGuard<'a, Box<dyn StorageBackend>>) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: 0,
            finished: false,
        })
    }

    /// Offset just past the last intact record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Size of the log when iteration started.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, LogEntry)>> {
        let record_offset = self.offset;
        let remaining = self.total_size - record_offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            tracing::warn!(offset = record_offset, "torn WAL header at end of log");
            return Ok(None);
        }

        let header = self.backend.read_at(record_offset, HEADER_SIZE)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if remaining - (HEADER_SIZE as u64) < length {
            tracing::warn!(
                offset = record_offset,
                length,
                "torn WAL record at end of log"
            );
            return Ok(None);
        }

        let payload = self
            .backend
            .read_at(record_offset + HEADER_SIZE as u64, length as usize)?;
        let stored = &header[4..4 + DIGEST_SIZE];
        if stored != compute_digest(&payload) {
            return Err(CoreError::wal_corruption(format!(
                "digest mismatch in record at offset {record_offset}"
            )));
        }

        let entry = LogEntry::decode_payload(&payload).map_err(|err| {
            CoreError::wal_corruption(format!("record at offset {record_offset}: {err}"))
        })?;
        self.offset = record_offset + HEADER_SIZE as u64 + length;
        Ok(Some((record_offset, entry)))
    }
}

impl Iterator for WalIterator<'_> {
    type Item = CoreResult<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
