//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::mutation::{compatible, Constraint, Mutation};
use crate::types::TransactionId;
use std::collections::HashMap;
use std::fmt;

/// State of a transaction.
///
/// `Open → InSubmit → Submitted → InCommitOrRollback`, after which the
/// transaction is freed. Only the coordinator moves a transaction out of
/// `InSubmit` or `InCommitOrRollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting mutations and constraints.
    Open,
    /// Queued for conflict checking.
    InSubmit,
    /// Passed its checks and logged; awaiting commit or rollback.
    Submitted,
    /// Queued for commit or rollback.
    InCommitOrRollback,
}

impl TransactionState {
    /// Name used in error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::InSubmit => "InSubmit",
            Self::Submitted => "Submitted",
            Self::InCommitOrRollback => "InCommitOrRollback",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An active transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub state: TransactionState,
    pub mutations: Vec<Mutation>,
    pub constraints: Vec<Constraint>,
    /// A `Submit` entry for this transaction is in the log.
    pub logged: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Open,
            mutations: Vec::new(),
            constraints: Vec::new(),
            logged: false,
        }
    }

    /// A transaction recovered from a `Submit` entry without a matching
    /// commit or rollback. Its constraints were not logged.
    pub fn recovered(mutations: Vec<Mutation>) -> Self {
        Self {
            state: TransactionState::Submitted,
            mutations,
            constraints: Vec::new(),
            logged: true,
        }
    }
}

/// Outcome of checking a candidate against the other submitted
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conflict {
    /// A candidate constraint collides with another's mutation.
    Constraint,
    /// A candidate mutation collides with another's constraint.
    Mutation,
}

/// Every live transaction, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct TransactionTable {
    transactions: HashMap<TransactionId, Transaction>,
}

impl TransactionTable {
    pub fn insert(&mut self, id: TransactionId, transaction: Transaction) {
        self.transactions.insert(id, transaction);
    }

    pub fn remove(&mut self, id: TransactionId) -> Option<Transaction> {
        self.transactions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn get(&self, id: TransactionId) -> CoreResult<&Transaction> {
        self.transactions
            .get(&id)
            .ok_or(CoreError::IllegalTransaction { id })
    }

    pub fn get_mut(&mut self, id: TransactionId) -> CoreResult<&mut Transaction> {
        self.transactions
            .get_mut(&id)
            .ok_or(CoreError::IllegalTransaction { id })
    }

    /// Returns the transaction if it is in one of `allowed`.
    pub fn expect_state(
        &mut self,
        id: TransactionId,
        operation: &'static str,
        allowed: &[TransactionState],
    ) -> CoreResult<&mut Transaction> {
        let transaction = self.get_mut(id)?;
        if !allowed.contains(&transaction.state) {
            return Err(CoreError::IllegalState {
                id,
                operation,
                state: transaction.state.name(),
            });
        }
        Ok(transaction)
    }

    /// Ids of submitted transactions, in id order.
    pub fn submitted(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.state == TransactionState::Submitted)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Checks `candidate` against every other logged transaction. A
    /// transaction with a pending commit or rollback still counts until the
    /// coordinator has processed it.
    pub fn find_conflict(&self, candidate: TransactionId) -> CoreResult<Option<Conflict>> {
        let this = self.get(candidate)?;
        for (id, other) in &self.transactions {
            if *id == candidate || !other.logged {
                continue;
            }
            let constraint_hit = this
                .constraints
                .iter()
                .any(|c| other.mutations.iter().any(|m| !compatible(m, c)));
            if constraint_hit {
                return Ok(Some(Conflict::Constraint));
            }
            let mutation_hit = other
                .constraints
                .iter()
                .any(|c| this.mutations.iter().any(|m| !compatible(m, c)));
            if mutation_hit {
                return Ok(Some(Conflict::Mutation));
            }
        }
        Ok(None)
    }
}
