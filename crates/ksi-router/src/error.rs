//! Router error types.

use ksi_core::{ErrorKind, KsiError};
use thiserror::Error;

/// Errors raised inside the router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The event log could not be written. Fatal: the daemon shuts down
    /// with a durable marker.
    #[error("event log write failed: {0}")]
    LogWrite(String),

    /// A transformer rule failed to parse or compile.
    #[error("bad transformer rule {rule}: {message}")]
    BadRule {
        /// Rule source pattern or index.
        rule: String,
        /// What was wrong.
        message: String,
    },

    /// The dispatch loop is gone.
    #[error("router is shut down")]
    ShutDown,
}

impl RouterError {
    /// Map onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LogWrite(_) => ErrorKind::Io,
            Self::BadRule { .. } => ErrorKind::InvalidArgument,
            Self::ShutDown => ErrorKind::Internal,
        }
    }
}

impl From<RouterError> for KsiError {
    fn from(e: RouterError) -> Self {
        KsiError::new(e.kind(), e.to_string())
    }
}

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;
