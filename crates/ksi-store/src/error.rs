//! Store error types.

use ksi_core::{ErrorKind, KsiError};
use thiserror::Error;

/// Errors raised by the durable store.
///
/// Only four conditions are recoverable by callers (`NotFound`, `Conflict`,
/// `Capacity`, `Io`); corruption is surfaced as `Corrupt` and treated as
/// fatal by the daemon.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed key, entity or relationship does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or compare-and-set expectation failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A queue or page bound was exceeded.
    #[error("capacity: {0}")]
    Capacity(String),

    /// A caller-supplied glob pattern failed to compile.
    #[error("invalid glob: {0}")]
    InvalidGlob(String),

    /// The engine reported an I/O-level failure.
    #[error("store io: {0}")]
    Io(String),

    /// A stored value failed to deserialize.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Map onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::InvalidGlob(_) => ErrorKind::InvalidArgument,
            Self::Io(_) => ErrorKind::Io,
            Self::Corrupt(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for KsiError {
    fn from(e: StoreError) -> Self {
        KsiError::new(e.kind(), e.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
