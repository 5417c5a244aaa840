// Error types shared by the association store and the listing layer

use std::fmt;

use crate::{AssociationId, GenericReference, PayloadKind, PayloadRef, TypeId};

/// Result type alias
pub type Result<T> = std::result::Result<T, AssocError>;

/// Why a stored association could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DanglingCause {
    /// The owning entity no longer exists
    OwnerMissing,
    /// The payload id no longer resolves
    PayloadMissing,
}

impl fmt::Display for DanglingCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DanglingCause::OwnerMissing => write!(f, "owner missing"),
            DanglingCause::PayloadMissing => write!(f, "payload missing"),
        }
    }
}

/// Why an aggregation request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeViolation {
    Empty,
    TooLarge { len: usize, ceiling: usize },
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeViolation::Empty => write!(f, "owner id list is empty"),
            ScopeViolation::TooLarge { len, ceiling } => {
                write!(f, "{} owner ids exceed the batch ceiling of {}", len, ceiling)
            }
        }
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum AssocError {
    #[error("Unknown type id: {0}")]
    UnknownType(TypeId),

    #[error("Unknown type kind: {0}")]
    UnknownKind(String),

    #[error("Association already exists: {reference} -> {payload} (id {existing})")]
    DuplicateAssociation {
        reference: GenericReference,
        payload: PayloadRef,
        existing: AssociationId,
    },

    #[error("Dangling reference: {reference} -> {payload:?} ({cause})")]
    DanglingReference {
        reference: GenericReference,
        payload: Option<PayloadRef>,
        cause: DanglingCause,
    },

    #[error("Aggregation scope error: {0}")]
    AggregationScope(ScopeViolation),

    #[error("No loader registered for payload kind: {0}")]
    MissingLoader(PayloadKind),

    #[error("No owner table registered for {0}")]
    MissingOwnerTable(TypeId),

    #[error("Owner {reference} not deleted after {removed} associations were removed: {reason}")]
    CascadeIncomplete {
        reference: GenericReference,
        removed: usize,
        reason: String,
    },

    #[error("Owner {reference} is protected by {dependents} dependents")]
    Protected {
        reference: GenericReference,
        dependents: usize,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl AssocError {
    /// Non-fatal conditions the caller may treat as success
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AssocError::DuplicateAssociation { .. })
    }

    /// Failures that must be surfaced and never retried automatically
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AssocError::DuplicateAssociation { .. } | AssocError::DanglingReference { .. }
        )
    }
}

impl From<serde_json::Error> for AssocError {
    fn from(err: serde_json::Error) -> Self {
        AssocError::Encoding(err.to_string())
    }
}
