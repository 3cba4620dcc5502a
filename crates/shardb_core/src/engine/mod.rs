//! The transaction engine.
//!
//! The engine owns every open and submitted transaction, the sequence id
//! counter, the write-ahead log and the set of storage and view drivers.
//!
//! ## Protocol
//!
//! - [`Engine::transaction`] opens a transaction; mutations and constraints
//!   are attached while it is `Open`. Inserts get their document id from
//!   the target storage at that point.
//! - [`Engine::submit`] checks the transaction against every other
//!   submitted transaction and its constraints against committed state,
//!   then logs a `Submit` entry.
//! - [`Engine::commit`] assigns the next sequence id, logs a `Commit` entry
//!   and hands the mutations to every driver. The completion fires once all
//!   drivers have applied them.
//! - [`Engine::submit_commit`] does both in one coordinator pass.
//! - [`Engine::rollback`] frees an open or submitted transaction.
//!
//! Sequence ids are consumed only by commits, so a rollback never leaves a
//! gap.

mod coordinator;
mod drivers;
pub(crate) mod replay;
mod transaction;

pub use transaction::TransactionState;

use crate::driver::{
    Document, FetchRequest, QueryRequest, QueryRow, StorageDriver, StorageQueue, ViewDriver,
    ViewQueue, ViewSettings,
};
use crate::error::{CoreError, CoreResult, FetchError, QueryError, SubmitError};
use crate::mutation::{Constraint, Mutation, MutationKind};
use crate::tasks::{pending, Pending, Resolver, TaskPool};
use crate::types::{DocumentId, SequenceId, StorageIndex, TransactionId, ViewIndex};
use crate::wal::{LogMutation, WriteAhead};
use coordinator::WorkItem;
use drivers::{DriverSet, StorageSlot, ViewSlot};
use parking_lot::{Mutex, RwLock};
use replay::Recovered;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use transaction::{Transaction, TransactionTable};

struct EngineState {
    table: TransactionTable,
    next_transaction: u64,
    /// Last sequence id written to the log.
    sequence_id: SequenceId,
    failed: Option<String>,
    queue: Option<mpsc::Sender<WorkItem>>,
}

/// State shared between the API and the coordinator thread.
pub(crate) struct EngineShared {
    wal: WriteAhead,
    process: Arc<TaskPool>,
    drivers: RwLock<DriverSet>,
    state: Mutex<EngineState>,
    /// Last sequence id queued to every driver.
    visible: AtomicU64,
}

impl EngineShared {
    fn check_failed(&self) -> CoreResult<()> {
        match &self.state.lock().failed {
            Some(reason) => Err(CoreError::shard_failed(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&self, err: &CoreError) {
        let mut state = self.state.lock();
        if state.failed.is_none() {
            tracing::error!(error = %err, "write-ahead log failed; shard refuses further work");
            state.failed = Some(err.to_string());
        }
    }
}

/// Sequences transactions into storage and view drivers.
pub struct Engine {
    shared: Arc<EngineShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// An engine with no drivers and a stopped coordinator.
    pub(crate) fn new(wal: WriteAhead, process: Arc<TaskPool>, recovered: &Recovered) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                wal,
                process,
                drivers: RwLock::new(DriverSet::default()),
                state: Mutex::new(EngineState {
                    table: TransactionTable::default(),
                    next_transaction: recovered.next_transaction.max(1),
                    sequence_id: recovered.sequence_id,
                    failed: None,
                    queue: None,
                }),
                visible: AtomicU64::new(recovered.sequence_id.as_u64()),
            }),
            coordinator: Mutex::new(None),
        }
    }

    /// Restores the transactions that were still submitted and starts the
    /// coordinator.
    pub(crate) fn resume(
        &self,
        submitted: BTreeMap<TransactionId, Vec<LogMutation>>,
    ) -> CoreResult<()> {
        let storages = self.shared.drivers.read().storage_names();
        let mut missing = HashSet::new();
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.state.lock();
            for (id, mutations) in submitted {
                let mutations = replay::translate(&mutations, &storages, &mut missing);
                tracing::info!(%id, mutations = mutations.len(), "restored submitted transaction");
                state.table.insert(id, Transaction::recovered(mutations));
            }
            state.queue = Some(tx);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || coordinator::run(shared, rx))?;
        *self.coordinator.lock() = Some(handle);
        Ok(())
    }

    /// Builds, back-fills and attaches a storage driver.
    ///
    /// `build` receives the slot and returns a driver whose files are
    /// already created or loaded. Every logged commit is re-sequenced into
    /// it before it is attached.
    pub(crate) fn install_storage<F>(
        &self,
        identifier: &str,
        driver: &str,
        build: F,
    ) -> CoreResult<StorageIndex>
    where
        F: FnOnce(StorageIndex) -> CoreResult<Box<dyn StorageDriver>>,
    {
        let mut drivers = self.shared.drivers.write();
        if drivers.find_storage(identifier).is_some() {
            return Err(CoreError::already_exists(identifier));
        }

        let index = StorageIndex(drivers.storages.len());
        let instance: Arc<dyn StorageDriver> = Arc::from(build(index)?);
        let mut storages = drivers.storage_names();
        storages.insert(identifier.to_string(), index);
        replay::resequence(&self.shared.wal, &storages, &*instance, identifier)?;

        let queue = StorageQueue::new(identifier, instance, Arc::clone(&self.shared.process))?;
        drivers.storages.push(Some(StorageSlot {
            identifier: identifier.to_string(),
            driver: driver.to_string(),
            queue: Arc::new(queue),
        }));
        tracing::info!(storage = identifier, driver, %index, "storage attached");
        Ok(index)
    }

    /// Builds, back-fills and attaches a view driver over
    /// `settings.base_storage`.
    pub(crate) fn install_view<F>(
        &self,
        identifier: &str,
        driver: &str,
        settings: ViewSettings,
        build: F,
    ) -> CoreResult<ViewIndex>
    where
        F: FnOnce(ViewIndex, StorageIndex, Arc<StorageQueue>) -> CoreResult<Box<dyn ViewDriver>>,
    {
        let mut drivers = self.shared.drivers.write();
        if drivers.find_view(identifier).is_some() {
            return Err(CoreError::already_exists(identifier));
        }
        let base_index = drivers
            .find_storage(&settings.base_storage)
            .ok_or_else(|| CoreError::unknown_target(&settings.base_storage))?;
        let base = Arc::clone(&drivers.storage(base_index)?.queue);

        let index = ViewIndex(drivers.views.len());
        let instance: Arc<dyn ViewDriver> = Arc::from(build(index, base_index, base)?);
        replay::resequence(
            &self.shared.wal,
            &drivers.storage_names(),
            &*instance,
            identifier,
        )?;

        let queue = ViewQueue::new(identifier, instance, Arc::clone(&self.shared.process))?;
        drivers.views.push(Some(ViewSlot {
            identifier: identifier.to_string(),
            driver: driver.to_string(),
            settings,
            queue: Arc::new(queue),
        }));
        tracing::info!(view = identifier, driver, %index, "view attached");
        Ok(index)
    }

    /// Detaches a storage. Its slot is not reused.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InUse`] while a view is built on the storage.
    pub(crate) fn remove_storage(&self, identifier: &str) -> CoreResult<()> {
        let slot = {
            let mut drivers = self.shared.drivers.write();
            let index = drivers
                .find_storage(identifier)
                .ok_or_else(|| CoreError::unknown_target(identifier))?;
            if let Some(view) = drivers
                .views
                .iter()
                .flatten()
                .find(|v| v.settings.base_storage == identifier)
            {
                return Err(CoreError::InUse {
                    identifier: identifier.to_string(),
                    user: view.identifier.clone(),
                });
            }
            drivers.storages[index.0].take()
        };
        // Dropping the queue applies what is still queued, then stops it.
        drop(slot);
        tracing::info!(storage = identifier, "storage unlinked");
        Ok(())
    }

    /// Detaches a view. Its slot is not reused.
    pub(crate) fn remove_view(&self, identifier: &str) -> CoreResult<()> {
        let slot = {
            let mut drivers = self.shared.drivers.write();
            let index = drivers
                .find_view(identifier)
                .ok_or_else(|| CoreError::unknown_target(identifier))?;
            drivers.views[index.0].take()
        };
        drop(slot);
        tracing::info!(view = identifier, "view unlinked");
        Ok(())
    }

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShardFailed`] after a log write failure.
    pub fn transaction(&self) -> CoreResult<TransactionId> {
        let mut state = self.shared.state.lock();
        if let Some(reason) = &state.failed {
            return Err(CoreError::shard_failed(reason.clone()));
        }
        let id = TransactionId::new(state.next_transaction);
        state.next_transaction += 1;
        state.table.insert(id, Transaction::new());
        Ok(id)
    }

    /// Attaches a mutation to an open transaction and returns the target
    /// document id, which is freshly allocated for inserts.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown transactions or storages, or if the
    /// transaction is no longer open.
    pub fn update_mutation(
        &self,
        id: TransactionId,
        mut mutation: Mutation,
    ) -> CoreResult<DocumentId> {
        self.shared.check_failed()?;
        let drivers = self.shared.drivers.read();
        let storage = drivers.storage(mutation.storage)?;

        let mut state = self.shared.state.lock();
        let transaction = state
            .table
            .expect_state(id, "update", &[TransactionState::Open])?;
        if mutation.kind == MutationKind::Insert {
            mutation.document_id = storage.queue.driver().allocate();
        }
        let document_id = mutation.document_id;
        transaction.mutations.push(mutation);
        Ok(document_id)
    }

    /// Attaches a constraint to an open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown transactions or storages, or if the
    /// transaction is no longer open.
    pub fn update_constraint(&self, id: TransactionId, constraint: Constraint) -> CoreResult<()> {
        self.shared.check_failed()?;
        self.shared.drivers.read().storage(constraint.storage)?;

        let mut state = self.shared.state.lock();
        state
            .table
            .expect_state(id, "update", &[TransactionState::Open])?
            .constraints
            .push(constraint);
        Ok(())
    }

    fn enqueue<T, E>(
        &self,
        id: TransactionId,
        operation: &'static str,
        allowed: &[TransactionState],
        next: TransactionState,
        item: impl FnOnce(Resolver<T, E>) -> WorkItem,
    ) -> CoreResult<Pending<T, E>> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if let Some(reason) = &state.failed {
            return Err(CoreError::shard_failed(reason.clone()));
        }
        let queue = state.queue.as_ref().ok_or(CoreError::Disconnected)?;
        let transaction = state.table.expect_state(id, operation, allowed)?;
        let previous = transaction.state;
        transaction.state = next;

        let (resolver, pending) = pending();
        // Sent under the state lock so queue order matches state changes.
        if queue.send(item(resolver)).is_err() {
            transaction.state = previous;
            return Err(CoreError::Disconnected);
        }
        Ok(pending)
    }

    /// Queues an open transaction for conflict checking and logging.
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states; the completion carries the outcome of the checks.
    pub fn submit(&self, id: TransactionId) -> CoreResult<Pending<(), SubmitError>> {
        self.enqueue(
            id,
            "submit",
            &[TransactionState::Open],
            TransactionState::InSubmit,
            |done| WorkItem::Submit { id, done },
        )
    }

    /// Submits and commits in one coordinator pass.
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or illegal
    /// states.
    pub fn submit_commit(&self, id: TransactionId) -> CoreResult<Pending<SequenceId, SubmitError>> {
        self.enqueue(
            id,
            "submit",
            &[TransactionState::Open],
            TransactionState::InSubmit,
            |done| WorkItem::SubmitCommit { id, done },
        )
    }

    /// Commits a submitted transaction. The completion carries the assigned
    /// sequence id once every driver has applied the mutations.
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or if the
    /// transaction is not submitted.
    pub fn commit(&self, id: TransactionId) -> CoreResult<Pending<SequenceId>> {
        self.enqueue(
            id,
            "commit",
            &[TransactionState::Submitted],
            TransactionState::InCommitOrRollback,
            |done| WorkItem::Commit { id, done },
        )
    }

    /// Rolls back an open or submitted transaction.
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown transactions or if the
    /// transaction is being submitted or committed.
    pub fn rollback(&self, id: TransactionId) -> CoreResult<Pending<()>> {
        self.enqueue(
            id,
            "rollback",
            &[TransactionState::Open, TransactionState::Submitted],
            TransactionState::InCommitOrRollback,
            |done| WorkItem::Rollback { id, done },
        )
    }

    /// Fetches the newest version of a document visible at `sequence_id`,
    /// or at the current sequence id if `None`.
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
        self.shared.check_failed()?;
        let queue = Arc::clone(&self.shared.drivers.read().storage(storage)?.queue);
        let request = FetchRequest {
            document_id,
            sequence_id: sequence_id.unwrap_or_else(|| self.current_sequence_id()),
        };
        Ok(queue.request(move |driver| driver.fetch(&request)))
    }

    /// Runs a view query. An unset visibility reads at the current sequence
    /// id.
    ///
    /// # Errors
    ///
    /// Returns an error right away for unknown views.
    pub fn query(
        &self,
        view: ViewIndex,
        mut request: QueryRequest,
    ) -> CoreResult<Pending<Vec<QueryRow>, QueryError>> {
        self.shared.check_failed()?;
        let queue = Arc::clone(&self.shared.drivers.read().view(view)?.queue);
        if request.sequence_id.is_none() {
            request.sequence_id = Some(self.current_sequence_id());
        }
        Ok(queue.request(move |driver| driver.query(&request)))
    }

    /// The newest sequence id whose mutations are queued to every driver.
    /// Fetches and queries at this id see the commit.
    #[must_use]
    pub fn current_sequence_id(&self) -> SequenceId {
        SequenceId::new(self.shared.visible.load(Ordering::SeqCst))
    }

    /// Slot of the storage set up under `identifier`.
    #[must_use]
    pub fn storage(&self, identifier: &str) -> Option<StorageIndex> {
        self.shared.drivers.read().find_storage(identifier)
    }

    /// Slot of the view set up under `identifier`.
    #[must_use]
    pub fn view(&self, identifier: &str) -> Option<ViewIndex> {
        self.shared.drivers.read().find_view(identifier)
    }

    /// Identifiers and driver names of the live storages, in slot order.
    #[must_use]
    pub fn storages(&self) -> Vec<(String, String)> {
        self.shared
            .drivers
            .read()
            .storages
            .iter()
            .flatten()
            .map(|s| (s.identifier.clone(), s.driver.clone()))
            .collect()
    }

    /// Identifiers and driver names of the live views, in slot order.
    #[must_use]
    pub fn views(&self) -> Vec<(String, String)> {
        self.shared
            .drivers
            .read()
            .views
            .iter()
            .flatten()
            .map(|v| (v.identifier.clone(), v.driver.clone()))
            .collect()
    }

    /// State of a live transaction.
    #[must_use]
    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        self.shared.state.lock().table.get(id).ok().map(|t| t.state)
    }

    /// Ids of the submitted transactions awaiting commit or rollback.
    #[must_use]
    pub fn submitted_transactions(&self) -> Vec<TransactionId> {
        self.shared.state.lock().table.submitted()
    }

    /// Number of live transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.shared.state.lock().table.len()
    }

    /// The log failure that stopped the shard, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.shared.state.lock().failed.clone()
    }

    /// Size of the write-ahead log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.shared.wal.size()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.state.lock().queue = None;
        if let Some(handle) = self.coordinator.lock().take() {
            let _ = handle.join();
        }
        // Each queue applies its backlog before its thread is joined.
        let drivers = std::mem::take(&mut *self.shared.drivers.write());
        drop(drivers);
        tracing::debug!("engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("current_sequence_id", &self.current_sequence_id())
            .field("active_transactions", &self.active_transactions())
            .finish_non_exhaustive()
    }
}
