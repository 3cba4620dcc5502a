//! Shard configuration.

/// Configuration for creating or opening a shard.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether [`crate::Shard::open`] may create a missing shard.
    pub create_if_missing: bool,

    /// Whether [`crate::Shard::open`] should fail on an existing shard.
    pub error_if_exists: bool,

    /// Byte budget shared by every page cache of the shard.
    pub cache_limit: u64,

    /// Size of one page in B-tree and data files.
    pub page_size: usize,

    /// Worker threads that execute page reads and write-backs.
    pub io_workers: usize,

    /// Worker threads that execute queued driver fetches and queries.
    pub process_workers: usize,

    /// Whether to fsync the WAL after every record.
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            cache_limit: 16 * 4096,
            page_size: 4096,
            io_workers: 2,
            process_workers: 2,
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the shard if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the shard exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the shared page cache budget in bytes.
    #[must_use]
    pub const fn cache_limit(mut self, bytes: u64) -> Self {
        self.cache_limit = bytes;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the number of I/O worker threads.
    #[must_use]
    pub const fn io_workers(mut self, count: usize) -> Self {
        self.io_workers = count;
        self
    }

    /// Sets the number of request worker threads.
    #[must_use]
    pub const fn process_workers(mut self, count: usize) -> Self {
        self.process_workers = count;
        self
    }

    /// Sets whether to sync the WAL on every record.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Checks that the values can work together.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::InvalidConfig`] for zero worker counts, a
    /// page size that is not a power of two of at least 256 bytes, or a
    /// cache budget smaller than one page.
    pub fn validate(&self) -> crate::CoreResult<()> {
        if self.io_workers == 0 || self.process_workers == 0 {
            return Err(crate::CoreError::invalid_config(
                "worker pools need at least one thread",
            ));
        }
        if self.page_size < 256 || !self.page_size.is_power_of_two() {
            return Err(crate::CoreError::invalid_config(format!(
                "page size {} must be a power of two >= 256",
                self.page_size
            )));
        }
        if self.cache_limit < self.page_size as u64 {
            return Err(crate::CoreError::invalid_config(format!(
                "cache limit {} is smaller than one page",
                self.cache_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(config.sync_on_commit);
        assert_eq!(config.cache_limit, 16 * 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .cache_limit(1 << 20)
            .page_size(512)
            .io_workers(4)
            .sync_on_commit(false);

        assert_eq!(config.cache_limit, 1 << 20);
        assert_eq!(config.page_size, 512);
        assert_eq!(config.io_workers, 4);
        assert!(!config.sync_on_commit);
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        assert!(Config::new().page_size(1000).validate().is_err());
        assert!(Config::new().page_size(128).validate().is_err());
        assert!(Config::new().cache_limit(100).validate().is_err());
        assert!(Config::new().io_workers(0).validate().is_err());
    }
}
