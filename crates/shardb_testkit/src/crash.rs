//! Write-failure injection for recovery tests.
//!
//! [`FailingBackend`] wraps any [`StorageBackend`] and, once armed, refuses
//! writes. It can also tear a write, so that half a record reaches the
//! inner backend before the error, which is what a crash in the middle of
//! an append leaves behind.
//!
//! The backend is usually moved into a shard, so it is controlled through a
//! [`FailSwitch`] that shares its state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shardb_testkit::crash::open_failing;
//!
//! let (shard, switch) = open_failing(dir.path(), test_config());
//! switch.fail_after_writes(1);
//! // the second log write fails and the shard refuses further work
//! ```

use shardb_core::{Config, DriverRegistry, Shard};
use shardb_storage::{FileBackend, StorageBackend, StorageError, StorageResult};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct FailState {
    writes_left: AtomicUsize,
    tear: AtomicBool,
    failed: AtomicBool,
    writes: AtomicUsize,
}

/// Controls a [`FailingBackend`] after it has been handed away.
#[derive(Debug, Clone)]
pub struct FailSwitch {
    state: Arc<FailState>,
}

impl FailSwitch {
    /// Lets `count` more writes through, then fails every write.
    pub fn fail_after_writes(&self, count: usize) {
        self.state.writes_left.store(count, Ordering::SeqCst);
    }

    /// Fails every write from now on.
    pub fn fail_now(&self) {
        self.fail_after_writes(0);
    }

    /// Makes failing appends write the first half of their data first.
    pub fn tear_writes(&self, tear: bool) {
        self.state.tear.store(tear, Ordering::SeqCst);
    }

    /// Lets writes through again.
    pub fn heal(&self) {
        self.state.writes_left.store(usize::MAX, Ordering::SeqCst);
        self.state.tear.store(false, Ordering::SeqCst);
    }

    /// Whether a write has been refused.
    pub fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }
}

/// A backend wrapper that fails writes on demand.
pub struct FailingBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<FailState>,
}

impl FailingBackend {
    /// Wraps `inner`; writes pass through until the switch is armed.
    pub fn new(inner: Box<dyn StorageBackend>) -> (Self, FailSwitch) {
        let state = Arc::new(FailState {
            writes_left: AtomicUsize::new(usize::MAX),
            tear: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        });
        let switch = FailSwitch {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, switch)
    }

    /// Consumes one write permit, or reports that the write must fail.
    fn permit(&self) -> bool {
        let granted = self
            .state
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if granted {
            self.state.writes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.failed.store(true, Ordering::SeqCst);
        }
        granted
    }

    fn injected() -> StorageError {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected write failure",
        ))
    }
}

impl StorageBackend for FailingBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if !self.permit() {
            return Err(Self::injected());
        }
        self.inner.write_at(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if !self.permit() {
            if self.state.tear.load(Ordering::SeqCst) && data.len() > 1 {
                self.inner.append(&data[..data.len() / 2])?;
                self.inner.flush()?;
            }
            return Err(Self::injected());
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Opens (or creates) a shard whose write-ahead log goes through a
/// [`FailingBackend`] over the shard's own log file.
pub fn open_failing(path: &Path, config: Config) -> (Shard, FailSwitch) {
    std::fs::create_dir_all(path).expect("Failed to create shard directory");
    let file = FileBackend::open(&path.join("transact.wal")).expect("Failed to open log file");
    let (backend, switch) = FailingBackend::new(Box::new(file));
    let registry = DriverRegistry::with_builtin();
    let shard = Shard::open_with_wal(path, config, registry, Box::new(backend))
        .expect("Failed to open shard");
    (shard, switch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardb_storage::InMemoryBackend;

    #[test]
    fn test_writes_pass_until_armed() {
        let (mut backend, switch) = FailingBackend::new(Box::new(InMemoryBackend::new()));
        backend.append(b"one").unwrap();
        switch.fail_after_writes(1);
        backend.append(b"two").unwrap();
        assert!(!switch.has_failed());

        assert!(backend.append(b"three").is_err());
        assert!(backend.write_at(0, b"x").is_err());
        assert!(switch.has_failed());
        assert_eq!(switch.writes(), 2);
        assert_eq!(backend.size().unwrap(), 6);

        switch.heal();
        backend.append(b"four").unwrap();
        assert_eq!(backend.size().unwrap(), 10);
    }

    #[test]
    fn test_torn_append_leaves_a_prefix() {
        let (mut backend, switch) = FailingBackend::new(Box::new(InMemoryBackend::new()));
        switch.tear_writes(true);
        switch.fail_now();

        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(backend.read_at(0, 3).unwrap(), b"abc");
        assert_eq!(backend.size().unwrap(), 3);
    }
}
