//! Shard facade and startup.

use crate::cache::CacheHost;
use crate::config::Config;
use crate::descriptor::{ShardConfig, StorageDescriptor, ViewDescriptor};
use crate::dir::{validate_identifier, ShardDir};
use crate::driver::{
    Document, DriverEnv, DriverRegistry, QueryRequest, QueryRow, StorageSetup, ViewSettings,
    ViewSetup,
};
use crate::engine::{replay, Engine, TransactionState};
use crate::error::{CoreError, CoreResult, FetchError, QueryError, SubmitError};
use crate::mutation::{Constraint, Mutation};
use crate::tasks::{Pending, TaskPool};
use crate::types::{DocumentId, SequenceId, StorageIndex, TransactionId, ViewIndex};
use crate::wal::WriteAhead;
use parking_lot::Mutex;
use shardb_storage::{FileBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;

/// One engine instance: a write-ahead log and the storages and views it
/// sequences into.
///
/// # Opening a Shard
///
/// ```rust,ignore
/// use shardb_core::{Config, DriverRegistry, Mutation, Shard, FLEX_STORAGE};
///
/// let shard = Shard::create(path, Config::default(), DriverRegistry::with_builtin())?;
/// let docs = shard.create_storage(FLEX_STORAGE, "docs")?;
///
/// let tx = shard.transaction()?;
/// let id = shard.update_mutation(tx, Mutation::insert(docs, b"a".to_vec()))?;
/// let seq = shard.submit_commit(tx)?.wait()?;
///
/// let doc = shard.fetch(docs, id, None)?.wait()?;
/// assert_eq!(doc.sequence_id, seq);
/// ```
pub struct Shard {
    // Drops first: stops the coordinator and every driver queue.
    engine: Engine,
    registry: DriverRegistry,
    env: DriverEnv,
    /// Serializes setup and unlink so the config file matches the engine.
    setup: Mutex<()>,
    // Drops last: releases the directory lock.
    dir: ShardDir,
}

impl Shard {
    /// Creates a new shard in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if a shard exists there,
    /// [`CoreError::ShardLocked`] if another process holds it, or the first
    /// I/O error.
    pub fn create(path: &Path, config: Config, registry: DriverRegistry) -> CoreResult<Self> {
        config.validate()?;
        let dir = ShardDir::open(path, true)?;
        if dir.has_config() {
            return Err(CoreError::already_exists(path.display().to_string()));
        }
        let wal = FileBackend::create(&dir.wal_path())?;
        Self::initialize(dir, config, registry, Box::new(wal))
    }

    /// Opens the shard in `path`, creating it if the config allows.
    ///
    /// Every storage and view listed in the shard config is rebuilt from the
    /// log before the shard accepts work. Transactions that were submitted
    /// but neither committed nor rolled back are restored as submitted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] if the log fails its digest check,
    /// [`CoreError::DriverNotFound`] if a descriptor names a driver missing
    /// from `registry`, or the first I/O error.
    pub fn open(path: &Path, config: Config, registry: DriverRegistry) -> CoreResult<Self> {
        config.validate()?;
        let dir = Self::lock(path, &config)?;
        let wal = FileBackend::open(&dir.wal_path())?;
        Self::open_in(dir, config, registry, Box::new(wal))
    }

    /// Opens the shard in `path` with a caller-supplied log backend.
    ///
    /// The shard directory still provides the lock, the config and the
    /// driver files; only the log lives in `wal`.
    ///
    /// # Errors
    ///
    /// Same as [`Shard::open`].
    pub fn open_with_wal(
        path: &Path,
        config: Config,
        registry: DriverRegistry,
        wal: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let dir = Self::lock(path, &config)?;
        Self::open_in(dir, config, registry, wal)
    }

    fn lock(path: &Path, config: &Config) -> CoreResult<ShardDir> {
        let dir = ShardDir::open(path, config.create_if_missing)?;
        if !dir.has_config() && !config.create_if_missing {
            return Err(CoreError::invalid_format(format!(
                "no shard at {} and create_if_missing is false",
                path.display()
            )));
        }
        if dir.has_config() && config.error_if_exists {
            return Err(CoreError::already_exists(path.display().to_string()));
        }
        Ok(dir)
    }

    fn open_in(
        dir: ShardDir,
        config: Config,
        registry: DriverRegistry,
        wal: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        if !dir.has_config() {
            return Self::initialize(dir, config, registry, wal);
        }

        let listed = dir.load_config()?;
        let wal = WriteAhead::new(wal, config.sync_on_commit);
        let recovered = replay::recover_metadata(&wal)?;
        if let Some(summary) = &recovered.summary {
            wal.discard_torn_tail(summary)?;
        }

        let env = Self::environment(&config)?;
        let engine = Engine::new(wal, Arc::clone(&env.process), &recovered);
        let shard = Self {
            engine,
            registry,
            env,
            setup: Mutex::new(()),
            dir,
        };

        for identifier in &listed.storages {
            let descriptor = shard.dir.load_storage_descriptor(identifier)?;
            shard.install_storage(identifier, &descriptor.driver, false)?;
        }
        for identifier in &listed.views {
            let descriptor = shard.dir.load_view_descriptor(identifier)?;
            shard.install_view(identifier, &descriptor.driver, descriptor.settings, false)?;
        }

        shard.engine.resume(recovered.submitted)?;
        tracing::info!(
            path = %shard.dir.path().display(),
            storages = listed.storages.len(),
            views = listed.views.len(),
            sequence_id = %shard.engine.current_sequence_id(),
            "shard opened"
        );
        Ok(shard)
    }

    fn initialize(
        dir: ShardDir,
        config: Config,
        registry: DriverRegistry,
        wal: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let wal = WriteAhead::new(wal, config.sync_on_commit);
        if wal.size()? != 0 {
            return Err(CoreError::invalid_format(
                "write-ahead log exists without a shard config",
            ));
        }
        dir.save_config(&ShardConfig::default())?;

        let recovered = replay::recover_metadata(&wal)?;
        let env = Self::environment(&config)?;
        let engine = Engine::new(wal, Arc::clone(&env.process), &recovered);
        engine.resume(recovered.submitted)?;
        tracing::info!(path = %dir.path().display(), "shard created");
        Ok(Self {
            engine,
            registry,
            env,
            setup: Mutex::new(()),
            dir,
        })
    }

    fn environment(config: &Config) -> CoreResult<DriverEnv> {
        Ok(DriverEnv {
            host: Arc::new(CacheHost::new(config.cache_limit)),
            io: Arc::new(TaskPool::new("io", config.io_workers)?),
            process: Arc::new(TaskPool::new("process", config.process_workers)?),
            page_size: config.page_size,
        })
    }

    fn install_storage(
        &self,
        identifier: &str,
        driver: &str,
        fresh: bool,
    ) -> CoreResult<StorageIndex> {
        let factory = self.registry.storage(driver)?;
        let path = self.dir.storage_path(identifier);
        let env = self.env.clone();
        self.engine.install_storage(identifier, driver, |index| {
            let mut storage = factory.build(StorageSetup {
                identifier: identifier.to_string(),
                index,
                path,
                env,
            })?;
            if fresh {
                storage.create_storage()?;
            } else {
                storage.load_storage()?;
            }
            Ok(storage)
        })
    }

    fn install_view(
        &self,
        identifier: &str,
        driver: &str,
        settings: ViewSettings,
        fresh: bool,
    ) -> CoreResult<ViewIndex> {
        let factory = self.registry.view(driver)?;
        let path = self.dir.view_path(identifier);
        let env = self.env.clone();
        let setup_settings = settings.clone();
        self.engine
            .install_view(identifier, driver, settings, |index, base_index, base| {
                let mut view = factory.build(ViewSetup {
                    identifier: identifier.to_string(),
                    index,
                    path,
                    env,
                    settings: setup_settings,
                    base_index,
                    base,
                })?;
                if fresh {
                    view.create_view()?;
                } else {
                    view.load_view()?;
                }
                Ok(view)
            })
    }

    fn save_config(&self) -> CoreResult<()> {
        let names = |list: Vec<(String, String)>| -> Vec<String> {
            list.into_iter().map(|(id, _)| id).collect()
        };
        self.dir.save_config(&ShardConfig {
            storages: names(self.engine.storages()),
            views: names(self.engine.views()),
        })
    }

    fn check_usable(&self, identifier: &str) -> CoreResult<()> {
        validate_identifier(identifier)?;
        match self.engine.failure() {
            Some(reason) => Err(CoreError::shard_failed(reason)),
            None => Ok(()),
        }
    }

    /// Sets up a new storage backed by the driver registered as `driver`.
    ///
    /// Mutations logged earlier under the same identifier are replayed into
    /// the new storage.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if the identifier is taken, or
    /// [`CoreError::DriverNotFound`] if no such driver is registered.
    pub fn create_storage(&self, driver: &str, identifier: &str) -> CoreResult<StorageIndex> {
        self.check_usable(identifier)?;
        let _setup = self.setup.lock();
        if self.engine.storage(identifier).is_some() {
            return Err(CoreError::already_exists(identifier));
        }
        self.registry.storage(driver)?;

        self.dir
            .save_storage_descriptor(identifier, &StorageDescriptor::new(driver))?;
        let index = match self.install_storage(identifier, driver, true) {
            Ok(index) => index,
            Err(err) => {
                self.discard(&self.dir.storage_path(identifier));
                return Err(err);
            }
        };
        self.save_config()?;
        Ok(index)
    }

    /// Sets up a new view backed by the driver registered as `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if the identifier is taken,
    /// [`CoreError::UnknownTarget`] if the base storage does not exist, or
    /// [`CoreError::DriverNotFound`] if no such driver or extractor is
    /// registered.
    pub fn create_view(
        &self,
        driver: &str,
        identifier: &str,
        settings: ViewSettings,
    ) -> CoreResult<ViewIndex> {
        self.check_usable(identifier)?;
        let _setup = self.setup.lock();
        if self.engine.view(identifier).is_some() {
            return Err(CoreError::already_exists(identifier));
        }
        if self.engine.storage(&settings.base_storage).is_none() {
            return Err(CoreError::unknown_target(&settings.base_storage));
        }
        self.registry.view(driver)?;

        self.dir.save_view_descriptor(
            identifier,
            &ViewDescriptor::new(driver, settings.clone()),
        )?;
        let index = match self.install_view(identifier, driver, settings, true) {
            Ok(index) => index,
            Err(err) => {
                self.discard(&self.dir.view_path(identifier));
                return Err(err);
            }
        };
        self.save_config()?;
        Ok(index)
    }

    /// Removes a storage and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTarget`] if no such storage exists, or
    /// [`CoreError::InUse`] while a view is built on it.
    pub fn unlink_storage(&self, identifier: &str) -> CoreResult<()> {
        let _setup = self.setup.lock();
        self.engine.remove_storage(identifier)?;
        self.save_config()?;
        self.discard(&self.dir.storage_path(identifier));
        Ok(())
    }

    /// Removes a view and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTarget`] if no such view exists.
    pub fn unlink_view(&self, identifier: &str) -> CoreResult<()> {
        let _setup = self.setup.lock();
        self.engine.remove_view(identifier)?;
        self.save_config()?;
        self.discard(&self.dir.view_path(identifier));
        Ok(())
    }

    // Leftover files are not listed in the config, so failing to delete
    // them is not fatal.
    fn discard(&self, dir: &Path) {
        if let Err(err) = self.dir.remove_tree(dir) {
            tracing::warn!(path = %dir.display(), error = %err, "could not delete driver files");
        }
    }

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShardFailed`] after a log write failure.
    pub fn transaction(&self) -> CoreResult<TransactionId> {
        self.engine.transaction()
    }

    /// Attaches a mutation to an open transaction. Returns the target
    /// document id, freshly allocated for inserts.
    ///
    /// # Errors
    ///
    /// See [`Engine::update_mutation`].
    pub fn update_mutation(&self, id: TransactionId, mutation: Mutation) -> CoreResult<DocumentId> {
        self.engine.update_mutation(id, mutation)
    }

    /// Attaches a constraint to an open transaction.
    ///
    /// # Errors
    ///
    /// See [`Engine::update_constraint`].
    pub fn update_constraint(&self, id: TransactionId, constraint: Constraint) -> CoreResult<()> {
        self.engine.update_constraint(id, constraint)
    }

    /// See [`Engine::submit`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states.
    pub fn submit(&self, id: TransactionId) -> CoreResult<Pending<(), SubmitError>> {
        self.engine.submit(id)
    }

    /// See [`Engine::submit_commit`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states.
    pub fn submit_commit(&self, id: TransactionId) -> CoreResult<Pending<SequenceId, SubmitError>> {
        self.engine.submit_commit(id)
    }

    /// See [`Engine::commit`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states.
    pub fn commit(&self, id: TransactionId) -> CoreResult<Pending<SequenceId>> {
        self.engine.commit(id)
    }

    /// See [`Engine::rollback`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states.
    pub fn rollback(&self, id: TransactionId) -> CoreResult<Pending<()>> {
        self.engine.rollback(id)
    }

    /// See [`Engine::fetch`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown storages.
    pub fn fetch(
        &self,
        storage: StorageIndex,
        document_id: DocumentId,
        sequence_id: Option<SequenceId>,
    ) -> CoreResult<Pending<Document, FetchError>> {
        self.engine.fetch(storage, document_id, sequence_id)
    }

    /// See [`Engine::query`].
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown views.
    pub fn query(
        &self,
        view: ViewIndex,
        request: QueryRequest,
    ) -> CoreResult<Pending<Vec<QueryRow>, QueryError>> {
        self.engine.query(view, request)
    }

    /// Newest sequence id visible to fetches and queries.
    #[must_use]
    pub fn current_sequence_id(&self) -> SequenceId {
        self.engine.current_sequence_id()
    }

    /// Slot of a storage.
    #[must_use]
    pub fn storage(&self, identifier: &str) -> Option<StorageIndex> {
        self.engine.storage(identifier)
    }

    /// Slot of a view.
    #[must_use]
    pub fn view(&self, identifier: &str) -> Option<ViewIndex> {
        self.engine.view(identifier)
    }

    /// State of a live transaction.
    #[must_use]
    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        self.engine.transaction_state(id)
    }

    /// The engine behind this shard.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Root directory of the shard.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Driver implementations available to this shard.
    #[must_use]
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("path", &self.dir.path())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
