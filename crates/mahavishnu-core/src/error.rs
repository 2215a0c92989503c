//! Error taxonomy shared across the control plane.
//!
//! Every fallible operation in this crate returns one of the typed errors
//! below rather than a bare `anyhow::Error`, so callers (the gateway, the
//! CLI) can match on error kind instead of parsing messages. See each
//! component module for the errors specific to it; this module holds the
//! ones shared across more than one component plus the umbrella
//! [`MahavishnuError`] used at crate boundaries.

use crate::identifier::{Identifier, IdentifierError};

/// Errors raised when a caller-supplied value fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{0}")]
    Identifier(#[from] IdentifierError),

    #[error("{message}")]
    Other { message: String },
}

/// Raised when a resource lookup by id fails.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("{kind} {id} not found")]
pub struct NotFoundError {
    pub kind: &'static str,
    pub id: Identifier,
}

impl NotFoundError {
    pub fn new(kind: &'static str, id: Identifier) -> Self {
        Self { kind, id }
    }
}

/// Raised when a resource with the same identity already exists.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("{kind} already exists: {detail}")]
pub struct DuplicateResourceError {
    pub kind: &'static str,
    pub detail: String,
}

/// Raised when a bounded resource (a queue, a pool) is at capacity.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("{resource} at capacity: {current}/{limit}")]
pub struct CapacityExceededError {
    pub resource: &'static str,
    pub current: usize,
    pub limit: usize,
}

/// Umbrella error composed at crate boundaries (the gateway and the CLI)
/// so a single `?` can cross every component's typed error.
#[derive(Debug, thiserror::Error)]
pub enum MahavishnuError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cycle(#[from] crate::graph::CycleError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Duplicate(#[from] DuplicateResourceError),

    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceededError),

    #[error(transparent)]
    Protocol(#[from] crate::sign::SignError),
}
