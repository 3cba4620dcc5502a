//! Driver factories by name.

use crate::driver::{
    FlexStorageFactory, OrderedViewFactory, StorageDriver, StorageSetup, ViewDriver, ViewSetup,
};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds storage drivers of one kind.
pub trait StorageFactory: Send + Sync {
    /// Name stored in storage descriptors.
    fn name(&self) -> &str;

    /// Builds an unopened driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the setup is unusable for this driver.
    fn build(&self, setup: StorageSetup) -> CoreResult<Box<dyn StorageDriver>>;
}

/// Builds view drivers of one kind.
pub trait ViewFactory: Send + Sync {
    /// Name stored in view descriptors.
    fn name(&self) -> &str;

    /// Builds an unopened driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the setup is unusable for this driver.
    fn build(&self, setup: ViewSetup) -> CoreResult<Box<dyn ViewDriver>>;
}

/// The driver implementations a shard may use.
///
/// Built by the caller and handed to [`crate::Shard::create`] or
/// [`crate::Shard::open`]; descriptors on disk name the factory to use.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    storages: HashMap<String, Arc<dyn StorageFactory>>,
    views: HashMap<String, Arc<dyn ViewFactory>>,
}

impl DriverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `FlexStorage` and `OrderedView`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_storage(Arc::new(FlexStorageFactory));
        registry.register_view(Arc::new(OrderedViewFactory::with_builtin()));
        registry
    }

    /// Adds or replaces a storage factory.
    pub fn register_storage(&mut self, factory: Arc<dyn StorageFactory>) {
        self.storages.insert(factory.name().to_string(), factory);
    }

    /// Adds or replaces a view factory.
    pub fn register_view(&mut self, factory: Arc<dyn ViewFactory>) {
        self.views.insert(factory.name().to_string(), factory);
    }

    /// Looks up a storage factory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DriverNotFound`] for unknown names.
    pub fn storage(&self, name: &str) -> CoreResult<Arc<dyn StorageFactory>> {
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::driver_not_found(name))
    }

    /// Looks up a view factory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DriverNotFound`] for unknown names.
    pub fn view(&self, name: &str) -> CoreResult<Arc<dyn ViewFactory>> {
        self.views
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::driver_not_found(name))
    }

    /// Registered storage driver names, sorted.
    #[must_use]
    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.storages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered view driver names, sorted.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.views.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("storages", &self.storage_names())
            .field("views", &self.view_names())
            .finish()
    }
}
