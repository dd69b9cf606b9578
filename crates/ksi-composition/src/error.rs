//! Composition loader error types.

use ksi_core::{ErrorKind, KsiError};
use thiserror::Error;

/// Errors raised while scanning or resolving composition content.
#[derive(Debug, Error)]
pub enum CompositionError {
    /// A content file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A content file is not valid YAML or lacks required frontmatter.
    #[error("malformed component {path}: {message}")]
    Malformed {
        /// File that failed.
        path: String,
        /// What was wrong.
        message: String,
    },

    /// A referenced component does not exist in the tree.
    #[error("unknown component: {0}")]
    Unknown(String),

    /// `extends`/`mixins` resolution found a cycle.
    #[error("inheritance cycle through {0}")]
    Cycle(String),

    /// A `{{...}}` interpolation names a variable outside the closed set.
    #[error("undefined variable {name} in component {component}")]
    UndefinedVariable {
        /// Variable name.
        name: String,
        /// Component being resolved.
        component: String,
    },

    /// The resolved component fails its type schema.
    #[error("invalid {component}: {message}")]
    Invalid {
        /// Component being validated.
        component: String,
        /// Violated rule.
        message: String,
    },
}

impl CompositionError {
    /// Map onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. } => ErrorKind::Io,
            Self::Unknown(_) => ErrorKind::NotFound,
            Self::Malformed { .. }
            | Self::Cycle(_)
            | Self::UndefinedVariable { .. }
            | Self::Invalid { .. } => ErrorKind::InvalidArgument,
        }
    }
}

impl From<CompositionError> for KsiError {
    fn from(e: CompositionError) -> Self {
        KsiError::new(e.kind(), e.to_string())
    }
}

/// Result type for composition operations.
pub type CompositionResult<T> = Result<T, CompositionError>;
