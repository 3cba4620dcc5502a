//! Mutations and constraints carried by transactions.

use crate::types::{DocumentId, SequenceId, StorageIndex};

/// Whether a mutation creates a document or writes a new version of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MutationKind {
    /// Creates a document; its id is allocated by the storage driver.
    Insert = 1,
    /// Writes a new version of an existing document.
    Modify = 2,
}

impl MutationKind {
    /// Converts a byte to a mutation kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Insert),
            2 => Some(Self::Modify),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One document write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Insert or modify.
    pub kind: MutationKind,
    /// Target storage driver.
    pub storage: StorageIndex,
    /// Target document. Assigned by the engine for inserts.
    pub document_id: DocumentId,
    /// The new document contents.
    pub buffer: Vec<u8>,
}

impl Mutation {
    /// An insert into `storage`; the document id is filled in when the
    /// mutation is attached to a transaction.
    #[must_use]
    pub fn insert(storage: StorageIndex, buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MutationKind::Insert,
            storage,
            document_id: DocumentId::new(0),
            buffer: buffer.into(),
        }
    }

    /// A new version of `document_id` in `storage`.
    #[must_use]
    pub fn modify(
        storage: StorageIndex,
        document_id: DocumentId,
        buffer: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind: MutationKind::Modify,
            storage,
            document_id,
            buffer: buffer.into(),
        }
    }
}

/// Kinds of pre-conditions a transaction can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// The document must be in a given state (exists, at a sequence id).
    DocumentState,
}

/// A pre-condition that must still hold when the transaction is admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// What is being asserted.
    pub kind: ConstraintKind,
    /// Storage holding the document.
    pub storage: StorageIndex,
    /// The document the constraint is about.
    pub document_id: DocumentId,
    /// If set, the newest committed version must carry this sequence id.
    pub match_sequence_id: Option<SequenceId>,
    /// Whether a missing document violates the constraint.
    pub must_exist: bool,
}

impl Constraint {
    /// A document-state constraint with no requirements yet.
    #[must_use]
    pub fn document_state(storage: StorageIndex, document_id: DocumentId) -> Self {
        Self {
            kind: ConstraintKind::DocumentState,
            storage,
            document_id,
            match_sequence_id: None,
            must_exist: false,
        }
    }

    /// Requires the document to exist.
    #[must_use]
    pub fn must_exist(mut self) -> Self {
        self.must_exist = true;
        self
    }

    /// Requires the newest committed version to be `sequence_id`.
    #[must_use]
    pub fn at_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.match_sequence_id = Some(sequence_id);
        self
    }
}

/// Whether a mutation can be admitted next to a constraint of a different
/// pending transaction.
///
/// Only a modify of a document that the constraint pins to a sequence id is
/// incompatible.
#[must_use]
pub fn compatible(mutation: &Mutation, constraint: &Constraint) -> bool {
    !(constraint.kind == ConstraintKind::DocumentState
        && constraint.match_sequence_id.is_some()
        && mutation.kind == MutationKind::Modify
        && mutation.storage == constraint.storage
        && mutation.document_id == constraint.document_id)
}
