//! Shard directory management.
//!
//! ```text
//! <shard>/
//! ├─ LOCK                       # advisory lock for single-process access
//! ├─ config                     # storage and view identifiers
//! ├─ transact.wal               # write-ahead log
//! ├─ storages/<id>/descriptor   # driver name; driver files live beside it
//! └─ views/<id>/descriptor      # driver name and view settings
//! ```
//!
//! The LOCK file ensures only one process opens the shard at a time.

use crate::descriptor::{ShardConfig, StorageDescriptor, ViewDescriptor};
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const CONFIG_FILE: &str = "config";
const WAL_FILE: &str = "transact.wal";
const STORAGES_DIR: &str = "storages";
const VIEWS_DIR: &str = "views";
const DESCRIPTOR_FILE: &str = "descriptor";
const TEMP_SUFFIX: &str = "tmp";

/// Checks that an identifier can name a driver directory.
///
/// # Errors
///
/// Returns [`CoreError::InvalidFormat`] for empty identifiers, `.`/`..`, and
/// identifiers containing path separators or NUL.
pub fn validate_identifier(identifier: &str) -> CoreResult<()> {
    let bad = identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.len() > usize::from(u16::MAX)
        || identifier.contains(['/', '\\', '\0']);
    if bad {
        return Err(CoreError::invalid_format(format!(
            "'{identifier}' cannot be used as an identifier"
        )));
    }
    Ok(())
}

/// A locked shard directory.
///
/// Only one `ShardDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct ShardDir {
    path: PathBuf,
    _lock_file: File,
}

impl ShardDir {
    /// Opens or creates a shard directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShardLocked`] if another process holds the lock,
    /// and [`CoreError::InvalidFormat`] if the directory is missing and
    /// `create_if_missing` is false or the path is not a directory.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "shard directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::ShardLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the shard.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Path of the config file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// Directory owned by a storage driver.
    #[must_use]
    pub fn storage_path(&self, identifier: &str) -> PathBuf {
        self.path.join(STORAGES_DIR).join(identifier)
    }

    /// Directory owned by a view driver.
    #[must_use]
    pub fn view_path(&self, identifier: &str) -> PathBuf {
        self.path.join(VIEWS_DIR).join(identifier)
    }

    /// Whether a shard was ever created here.
    #[must_use]
    pub fn has_config(&self) -> bool {
        self.config_path().exists()
    }

    /// Reads the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load_config(&self) -> CoreResult<ShardConfig> {
        ShardConfig::decode(&fs::read(self.config_path())?)
    }

    /// Replaces the config atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_config(&self, config: &ShardConfig) -> CoreResult<()> {
        write_atomic(&self.config_path(), &config.encode())
    }

    /// Reads the descriptor of a storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load_storage_descriptor(&self, identifier: &str) -> CoreResult<StorageDescriptor> {
        let path = self.storage_path(identifier).join(DESCRIPTOR_FILE);
        StorageDescriptor::decode(&fs::read(path)?)
    }

    /// Writes the descriptor of a storage, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_storage_descriptor(
        &self,
        identifier: &str,
        descriptor: &StorageDescriptor,
    ) -> CoreResult<()> {
        let dir = self.storage_path(identifier);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(DESCRIPTOR_FILE), &descriptor.encode())
    }

    /// Reads the descriptor of a view.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load_view_descriptor(&self, identifier: &str) -> CoreResult<ViewDescriptor> {
        let path = self.view_path(identifier).join(DESCRIPTOR_FILE);
        ViewDescriptor::decode(&fs::read(path)?)
    }

    /// Writes the descriptor of a view, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_view_descriptor(
        &self,
        identifier: &str,
        descriptor: &ViewDescriptor,
    ) -> CoreResult<()> {
        let dir = self.view_path(identifier);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(DESCRIPTOR_FILE), &descriptor.encode())
    }

    /// Deletes a directory and everything in it, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn remove_tree(&self, dir: &Path) -> CoreResult<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
            if let Some(parent) = dir.parent() {
                sync_directory(parent)?;
            }
        }
        Ok(())
    }
}

/// Write-then-rename:
/// 1. write a sibling temp file and sync it
/// 2. rename it over `target`
/// 3. sync the parent directory so the rename is durable
fn write_atomic(target: &Path, data: &[u8]) -> CoreResult<()> {
    let temp = target.with_extension(TEMP_SUFFIX);
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, target)?;
    if let Some(parent) = target.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directories cannot be opened for sync.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ViewSettings;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard");

        let first = ShardDir::open(&path, true).unwrap();
        assert!(matches!(
            ShardDir::open(&path, true),
            Err(CoreError::ShardLocked)
        ));

        drop(first);
        assert!(ShardDir::open(&path, false).is_ok());
    }

    #[test]
    fn missing_directory_without_create() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ShardDir::open(&dir.path().join("absent"), false),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn config_and_descriptors_persist() {
        let dir = tempdir().unwrap();
        let shard = ShardDir::open(dir.path(), true).unwrap();
        assert!(!shard.has_config());

        let config = ShardConfig {
            storages: vec!["docs".into()],
            views: vec!["by_body".into()],
        };
        shard.save_config(&config).unwrap();
        shard
            .save_storage_descriptor("docs", &StorageDescriptor::new("FlexStorage"))
            .unwrap();
        let view = ViewDescriptor::new("OrderedView", ViewSettings::new("docs", "raw"));
        shard.save_view_descriptor("by_body", &view).unwrap();

        assert!(shard.has_config());
        assert_eq!(shard.load_config().unwrap(), config);
        assert_eq!(
            shard.load_storage_descriptor("docs").unwrap().driver,
            "FlexStorage"
        );
        assert_eq!(shard.load_view_descriptor("by_body").unwrap(), view);
        assert!(!shard.config_path().with_extension(TEMP_SUFFIX).exists());
    }

    #[test]
    fn remove_tree_tolerates_missing_dirs() {
        let dir = tempdir().unwrap();
        let shard = ShardDir::open(dir.path(), true).unwrap();
        shard
            .save_storage_descriptor("docs", &StorageDescriptor::new("FlexStorage"))
            .unwrap();

        shard.remove_tree(&shard.storage_path("docs")).unwrap();
        assert!(!shard.storage_path("docs").exists());
        shard.remove_tree(&shard.storage_path("docs")).unwrap();
    }

    #[test]
    fn identifiers_must_be_plain_names() {
        assert!(validate_identifier("docs").is_ok());
        assert!(validate_identifier("by-body_2").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(validate_identifier(bad).is_err(), "{bad:?}");
        }
    }
}
