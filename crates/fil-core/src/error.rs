//! Cross-component error taxonomy.
//!
//! Components return typed errors; the HTTP boundary translates them to
//! transport status codes by kind rather than by concrete type.

use thiserror::Error;
use uuid::Uuid;

/// Kind of failure, used by the boundary translator to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Unauthorized,
    Forbidden,
    Unavailable,
    Internal,
}

/// Anything that can be mapped onto the taxonomy.
pub trait Categorized {
    fn kind(&self) -> ErrorKind;
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bead not found: {0}")]
    BeadNotFound(Uuid),

    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),

    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("decision not found: {0}")]
    DecisionNotFound(Uuid),

    #[error("session not found")]
    SessionNotFound,

    #[error("motivation rule not found: {0}")]
    RuleNotFound(Uuid),

    #[error("bead {0} is already claimed")]
    AlreadyClaimed(Uuid),

    #[error("bead {0} is not ready: {1}")]
    NotReady(Uuid, String),

    #[error("file is locked by another agent: {path}")]
    FileLocked { path: String, holder: Uuid },

    #[error("dependency cycle through bead {0}")]
    DependencyCycle(Uuid),

    #[error("project {0} is closed")]
    ProjectClosed(Uuid),

    #[error("project {0} still has open beads")]
    ProjectHasOpenBeads(Uuid),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::types::BeadStatus,
        to: crate::types::BeadStatus,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("schema version mismatch: export is {found}, store expects {expected}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    #[error("import conflict on table {table}: row {id}")]
    ImportConflict { table: String, id: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl Categorized for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::BeadNotFound(_)
            | StoreError::ProjectNotFound(_)
            | StoreError::AgentNotFound(_)
            | StoreError::DecisionNotFound(_)
            | StoreError::SessionNotFound
            | StoreError::RuleNotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyClaimed(_)
            | StoreError::FileLocked { .. }
            | StoreError::SchemaVersionMismatch { .. }
            | StoreError::ImportConflict { .. }
            | StoreError::ProjectHasOpenBeads(_) => ErrorKind::Conflict,
            StoreError::NotReady(_, _)
            | StoreError::DependencyCycle(_)
            | StoreError::ProjectClosed(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::Storage(_) => ErrorKind::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
