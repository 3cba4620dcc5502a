//! Storage and view slots of an engine.

use crate::driver::{StorageQueue, ViewQueue, ViewSettings};
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::types::{StorageIndex, ViewIndex};
use crate::wal::LogMutation;
use std::collections::HashMap;
use std::sync::Arc;

/// A storage set up in the engine.
#[derive(Debug)]
pub(crate) struct StorageSlot {
    pub identifier: String,
    pub driver: String,
    pub queue: Arc<StorageQueue>,
}

/// A view set up in the engine.
#[derive(Debug)]
pub(crate) struct ViewSlot {
    pub identifier: String,
    pub driver: String,
    pub settings: ViewSettings,
    pub queue: Arc<ViewQueue>,
}

/// Slots are never reused; unlinking leaves a hole so that indices held by
/// clients stay unambiguous.
#[derive(Debug, Default)]
pub(crate) struct DriverSet {
    pub storages: Vec<Option<StorageSlot>>,
    pub views: Vec<Option<ViewSlot>>,
}

impl DriverSet {
    pub fn storage(&self, index: StorageIndex) -> CoreResult<&StorageSlot> {
        self.storages
            .get(index.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::unknown_target(index))
    }

    pub fn view(&self, index: ViewIndex) -> CoreResult<&ViewSlot> {
        self.views
            .get(index.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::unknown_target(index))
    }

    pub fn find_storage(&self, identifier: &str) -> Option<StorageIndex> {
        self.storages
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.identifier == identifier))
            .map(StorageIndex)
    }

    pub fn find_view(&self, identifier: &str) -> Option<ViewIndex> {
        self.views
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.identifier == identifier))
            .map(ViewIndex)
    }

    /// Identifier to slot, for translating logged mutations.
    pub fn storage_names(&self) -> HashMap<String, StorageIndex> {
        self.storages
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (s.identifier.clone(), StorageIndex(i))))
            .collect()
    }

    /// Number of live storages and views.
    pub fn live(&self) -> usize {
        self.storages.iter().flatten().count() + self.views.iter().flatten().count()
    }

    /// Translates mutations into their logged form.
    pub fn to_log(&self, mutations: &[Mutation]) -> CoreResult<Vec<LogMutation>> {
        mutations
            .iter()
            .map(|m| {
                Ok(LogMutation {
                    kind: m.kind,
                    storage: self.storage(m.storage)?.identifier.clone(),
                    document_id: m.document_id,
                    buffer: m.buffer.clone(),
                })
            })
            .collect()
    }
}

/// Translates a logged mutation back, if its storage still exists.
pub(crate) fn from_log(
    mutation: &LogMutation,
    storages: &HashMap<String, StorageIndex>,
) -> Option<Mutation> {
    storages.get(&mutation.storage).map(|&storage| Mutation {
        kind: mutation.kind,
        storage,
        document_id: mutation.document_id,
        buffer: mutation.buffer.clone(),
    })
}
