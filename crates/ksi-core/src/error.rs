//! The wire error taxonomy.
//!
//! Every failure that crosses a component boundary is described by an
//! [`ErrorKind`] plus a human message and a retryability flag. Component
//! crates keep their own `thiserror` enums internally and convert at the
//! boundary via `KsiError`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::CorrelationId;

/// Classification of every error that crosses a component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema mismatch, unknown parameter, bad enum value.
    InvalidArgument,
    /// Entity, session, request or composition does not exist.
    NotFound,
    /// Duplicate id, CAS failure, already-terminated target.
    Conflict,
    /// Capability missing or sandbox escape attempt.
    PermissionDenied,
    /// Queue full, concurrency cap hit, retry budget exhausted.
    Capacity,
    /// Lock, provider or handler timeout.
    Timeout,
    /// Explicit cancel or cascading termination.
    Cancelled,
    /// Non-retryable failure reported by an LLM provider.
    ProviderError,
    /// Store or transport failure.
    Io,
    /// Invariant violation; treated as a bug.
    Internal,
}

impl ErrorKind {
    /// The wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission_denied",
            Self::Capacity => "capacity",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ProviderError => "provider_error",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error, ready for the wire.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct KsiError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Whether the caller may reasonably retry.
    pub retryable: bool,
}

impl KsiError {
    /// Build an error of the given kind. Retryability defaults per kind:
    /// only `timeout`, `capacity` and `io` are retryable by default.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, ErrorKind::Timeout | ErrorKind::Capacity | ErrorKind::Io);
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Override the retryability flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Schema mismatch, unknown parameter, bad enum value.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Entity, session, request or composition does not exist.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Duplicate id, CAS failure, already-terminated target.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Capability missing or sandbox escape attempt.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// Queue full, concurrency cap hit, retry budget exhausted.
    #[must_use]
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, message)
    }

    /// Lock, provider or handler timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Explicit cancel or cascading termination.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Non-retryable provider failure.
    #[must_use]
    pub fn provider_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderError, message)
    }

    /// Store or transport failure.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Invariant violation; treated as a bug.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<serde_json::Error> for KsiError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<std::io::Error> for KsiError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

/// Result alias used across component boundaries.
pub type KsiResult<T> = Result<T, KsiError>;

/// The body of an error frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error classification string (`invalid_argument`, `timeout`, …).
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Whether the caller may reasonably retry.
    pub retryable: bool,
    /// Correlation back to the causal chain that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// A single error frame: `{ "error": { ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// The error payload.
    pub error: ErrorBody,
}

impl ErrorFrame {
    /// Wrap a [`KsiError`] with its correlation id for the wire.
    #[must_use]
    pub fn from_error(err: &KsiError, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind,
                message: err.message.clone(),
                retryable: err.retryable,
                correlation_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_strings() {
        assert_eq!(ErrorKind::InvalidArgument.as_str(), "invalid_argument");
        assert_eq!(ErrorKind::ProviderError.as_str(), "provider_error");
        let json = serde_json::to_string(&ErrorKind::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission_denied\"");
    }

    #[test]
    fn test_default_retryability() {
        assert!(KsiError::timeout("t").retryable);
        assert!(KsiError::capacity("c").retryable);
        assert!(KsiError::io("i").retryable);
        assert!(!KsiError::invalid_argument("x").retryable);
        assert!(!KsiError::provider_error("p").retryable);
        assert!(KsiError::provider_error("p").retryable(true).retryable);
    }

    #[test]
    fn test_error_frame_shape() {
        let err = KsiError::not_found("no such agent");
        let frame = ErrorFrame::from_error(&err, Some(CorrelationId::from("corr_1")));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["error"]["kind"], "not_found");
        assert_eq!(json["error"]["message"], "no such agent");
        assert_eq!(json["error"]["correlation_id"], "corr_1");
    }
}
