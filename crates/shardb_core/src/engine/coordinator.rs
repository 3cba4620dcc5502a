//! The coordinator thread.
//!
//! Submits, commits and rollbacks are processed one at a time from a FIFO,
//! so no two submits race through conflict checking and sequence ids are
//! assigned in log order.

use crate::driver::{FetchRequest, SequenceDone};
use crate::engine::drivers::DriverSet;
use crate::engine::transaction::{Conflict, TransactionState};
use crate::engine::EngineShared;
use crate::error::{CoreError, CoreResult, FetchError, SubmitError};
use crate::mutation::{Constraint, Mutation};
use crate::tasks::Resolver;
use crate::types::{SequenceId, TransactionId};
use crate::wal::LogEntry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

/// Work for the coordinator.
pub(crate) enum WorkItem {
    Submit {
        id: TransactionId,
        done: Resolver<(), SubmitError>,
    },
    SubmitCommit {
        id: TransactionId,
        done: Resolver<SequenceId, SubmitError>,
    },
    Commit {
        id: TransactionId,
        done: Resolver<SequenceId>,
    },
    Rollback {
        id: TransactionId,
        done: Resolver<()>,
    },
}

/// Drains `items` until every sender is gone.
pub(crate) fn run(shared: Arc<EngineShared>, items: mpsc::Receiver<WorkItem>) {
    while let Ok(item) = items.recv() {
        match item {
            WorkItem::Submit { id, done } => shared.process_submit(id, done),
            WorkItem::SubmitCommit { id, done } => shared.process_submit_commit(id, done),
            WorkItem::Commit { id, done } => shared.process_commit(id, done),
            WorkItem::Rollback { id, done } => shared.process_rollback(id, done),
        }
    }
    tracing::debug!("coordinator stopped");
}

/// Collects one acknowledgement per driver for a commit.
struct AckGroup {
    remaining: AtomicUsize,
    error: Mutex<Option<CoreError>>,
    done: Mutex<Option<SequenceDone>>,
}

impl AckGroup {
    fn new(count: usize, done: SequenceDone) -> Arc<Self> {
        let group = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            error: Mutex::new(None),
            done: Mutex::new(Some(done)),
        });
        if count == 0 {
            group.finish();
        }
        group
    }

    fn ack(self: &Arc<Self>) -> SequenceDone {
        let group = Arc::clone(self);
        Box::new(move |result| group.record(result))
    }

    fn record(&self, result: CoreResult<()>) {
        if let Err(err) = result {
            let mut first = self.error.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let result = match self.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(done) = self.done.lock().take() {
            done(result);
        }
    }
}

impl EngineShared {
    fn free(&self, id: TransactionId) {
        self.state.lock().table.remove(id);
    }

    /// Appends to the log; a failed write fails the shard.
    fn write(&self, entry: &LogEntry) -> CoreResult<()> {
        self.check_failed()?;
        match self.wal.log(entry) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Conflict checks against other submitted transactions, then
    /// constraint checks against committed state.
    fn admit(&self, id: TransactionId) -> Result<(), SubmitError> {
        let (constraints, sequence_id) = {
            let state = self.state.lock();
            match state.table.find_conflict(id)? {
                Some(Conflict::Constraint) => return Err(SubmitError::ConstraintConflict),
                Some(Conflict::Mutation) => return Err(SubmitError::MutationConflict),
                None => {}
            }
            (state.table.get(id)?.constraints.clone(), state.sequence_id)
        };

        for constraint in &constraints {
            self.check_constraint(constraint, sequence_id)?;
        }
        Ok(())
    }

    fn check_constraint(
        &self,
        constraint: &Constraint,
        sequence_id: SequenceId,
    ) -> Result<(), SubmitError> {
        let queue = Arc::clone(&self.drivers.read().storage(constraint.storage)?.queue);
        let request = FetchRequest {
            document_id: constraint.document_id,
            sequence_id,
        };

        // Blocks until every queued commit has been applied.
        let holds = match queue.call(|driver| driver.fetch(&request)) {
            Ok(document) => constraint
                .match_sequence_id
                .map_or(true, |expected| expected == document.sequence_id),
            Err(FetchError::DocumentNotFound) => {
                !constraint.must_exist && constraint.match_sequence_id.is_none()
            }
            Err(FetchError::Storage(err)) => return Err(err.into()),
        };

        if holds {
            Ok(())
        } else {
            Err(SubmitError::ConstraintViolation)
        }
    }

    fn log_submit(&self, id: TransactionId) -> CoreResult<()> {
        let drivers = self.drivers.read();
        let mutations = drivers.to_log(&self.state.lock().table.get(id)?.mutations)?;
        self.write(&LogEntry::Submit {
            txid: id,
            mutations,
        })?;

        let mut state = self.state.lock();
        let transaction = state.table.get_mut(id)?;
        transaction.state = TransactionState::Submitted;
        transaction.logged = true;
        Ok(())
    }

    /// Assigns the next sequence id and logs the commit. The id is only
    /// consumed once the record is written.
    fn log_commit(
        &self,
        drivers: &DriverSet,
        id: TransactionId,
        with_submit: bool,
    ) -> CoreResult<(SequenceId, Vec<Mutation>)> {
        let (sequence_id, mutations) = {
            let mut state = self.state.lock();
            let next = state.sequence_id.next();
            let transaction = state.table.get_mut(id)?;
            // From here on committed state covers the transaction.
            transaction.constraints.clear();
            (next, std::mem::take(&mut transaction.mutations))
        };

        let entry = if with_submit {
            LogEntry::SubmitCommit {
                txid: id,
                sequence_id,
                mutations: drivers.to_log(&mutations)?,
            }
        } else {
            LogEntry::Commit {
                txid: id,
                sequence_id,
            }
        };
        self.write(&entry)?;

        let mut state = self.state.lock();
        state.sequence_id = sequence_id;
        state.table.get_mut(id)?.state = TransactionState::InCommitOrRollback;
        Ok((sequence_id, mutations))
    }

    /// Queues the mutations to every driver. `done` runs once all of them
    /// have acknowledged.
    fn fan_out(
        &self,
        drivers: &DriverSet,
        sequence_id: SequenceId,
        mutations: Vec<Mutation>,
        done: SequenceDone,
    ) {
        let mutations: Arc<[Mutation]> = mutations.into();
        let group = AckGroup::new(drivers.live(), done);
        for slot in drivers.storages.iter().flatten() {
            slot.queue.sequence(sequence_id, Arc::clone(&mutations), group.ack());
        }
        for slot in drivers.views.iter().flatten() {
            slot.queue.sequence(sequence_id, Arc::clone(&mutations), group.ack());
        }
        self.publish(sequence_id);
    }

    fn publish(&self, sequence_id: SequenceId) {
        self.visible.fetch_max(sequence_id.as_u64(), Ordering::SeqCst);
    }

    /// Builds the completion of a commit: frees the transaction and hands
    /// the outcome to `resolve`.
    fn on_sequenced<R>(
        self: &Arc<Self>,
        id: TransactionId,
        sequence_id: SequenceId,
        resolve: R,
    ) -> SequenceDone
    where
        R: FnOnce(CoreResult<SequenceId>) + Send + 'static,
    {
        let shared = Arc::downgrade(self);
        Box::new(move |result: CoreResult<()>| {
            if let Some(shared) = shared.upgrade() {
                shared.free(id);
                shared.publish(sequence_id);
            }
            match &result {
                Ok(()) => tracing::debug!(%id, %sequence_id, "committed"),
                Err(err) => tracing::warn!(
                    %id,
                    %sequence_id,
                    error = %err,
                    "commit not applied by every driver"
                ),
            }
            resolve(result.map(|()| sequence_id));
        })
    }

    fn process_submit(self: &Arc<Self>, id: TransactionId, done: Resolver<(), SubmitError>) {
        let result = self
            .admit(id)
            .and_then(|()| self.log_submit(id).map_err(SubmitError::from));
        match &result {
            Ok(()) => tracing::debug!(%id, "submitted"),
            Err(err) => {
                self.free(id);
                tracing::debug!(%id, error = %err, "submit refused");
            }
        }
        done.resolve(result);
    }

    fn process_submit_commit(
        self: &Arc<Self>,
        id: TransactionId,
        done: Resolver<SequenceId, SubmitError>,
    ) {
        if let Err(err) = self.admit(id) {
            self.free(id);
            tracing::debug!(%id, error = %err, "submit refused");
            done.resolve(Err(err));
            return;
        }

        let drivers = self.drivers.read();
        match self.log_commit(&drivers, id, true) {
            Ok((sequence_id, mutations)) => {
                let complete = self.on_sequenced(id, sequence_id, move |result| {
                    done.resolve(result.map_err(SubmitError::from));
                });
                self.fan_out(&drivers, sequence_id, mutations, complete);
            }
            Err(err) => {
                self.free(id);
                done.resolve(Err(err.into()));
            }
        }
    }

    fn process_commit(self: &Arc<Self>, id: TransactionId, done: Resolver<SequenceId>) {
        let drivers = self.drivers.read();
        match self.log_commit(&drivers, id, false) {
            Ok((sequence_id, mutations)) => {
                let complete =
                    self.on_sequenced(id, sequence_id, move |result| done.resolve(result));
                self.fan_out(&drivers, sequence_id, mutations, complete);
            }
            Err(err) => {
                self.free(id);
                done.resolve(Err(err));
            }
        }
    }

    fn process_rollback(&self, id: TransactionId, done: Resolver<()>) {
        let logged = self.state.lock().table.get(id).map(|t| t.logged);
        let result = match logged {
            Ok(true) => self.write(&LogEntry::Rollback { txid: id }),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        self.free(id);
        tracing::debug!(%id, ok = result.is_ok(), "rolled back");
        done.resolve(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_group_waits_for_every_driver() {
        let (tx, rx) = mpsc::channel();
        let group = AckGroup::new(
            3,
            Box::new(move |result: CoreResult<()>| tx.send(result.is_ok()).unwrap()),
        );
        let acks: Vec<_> = (0..3).map(|_| group.ack()).collect();
        let mut acks = acks.into_iter();

        acks.next().unwrap()(Ok(()));
        acks.next().unwrap()(Ok(()));
        assert!(rx.try_recv().is_err());
        acks.next().unwrap()(Ok(()));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn ack_group_reports_first_error() {
        let (tx, rx) = mpsc::channel();
        let group = AckGroup::new(
            2,
            Box::new(move |result: CoreResult<()>| tx.send(result).unwrap()),
        );
        group.ack()(Err(CoreError::invariant("first")));
        group.ack()(Err(CoreError::invariant("second")));
        match rx.recv().unwrap() {
            Err(CoreError::InvariantViolation { message }) => assert_eq!(message, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_ack_group_completes_at_once() {
        let (tx, rx) = mpsc::channel();
        let _group = AckGroup::new(
            0,
            Box::new(move |result: CoreResult<()>| tx.send(result.is_ok()).unwrap()),
        );
        assert!(rx.try_recv().unwrap());
    }
}
