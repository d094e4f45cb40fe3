//! Crate-wide error taxonomy.
//!
//! Five semantic kinds, matching the propagation policy each component
//! relies on: `NotFound` callers decide how to fall back, `PreconditionFailed`
//! and `Storage` are the only kinds meant to surface to a user,
//! `Conflict` is a silent-skip in the observation paths and a raised error
//! everywhere else, `Timeout` is re-raised after the caller clears its own
//! in-progress flag.

use thiserror::Error;

/// Unified error type returned by every engine in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lookup by id missed. Callers decide whether to fall back.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition was violated: closing without a summary, claiming a
    /// blocked or closed task, an invalid scope argument, a dependency cycle.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The lease (or a conditional update guarded by `(owner, operation_id)`)
    /// is held by, or was last written by, someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An observer or reflector call exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// A transient failure in the backing store.
    #[error("storage error: {0}")]
    Storage(String),

    /// A JSON metadata column failed to (de)serialize. Distinct from
    /// `Storage` because it is a data-shape problem, not a connectivity one.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<deadpool_sqlite::PoolError> for CoreError {
    fn from(e: deadpool_sqlite::PoolError) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<deadpool_sqlite::InteractError> for CoreError {
    fn from(e: deadpool_sqlite::InteractError) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for CoreError {
    fn from(e: rusqlite_migration::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

/// True for the two kinds the spec designates user-visible (§7).
impl CoreError {
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            CoreError::PreconditionFailed(_) | CoreError::Storage(_)
        )
    }
}
