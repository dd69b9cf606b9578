//! Transport error types.

use ksi_core::{ErrorKind, KsiError};
use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket bind / accept / read / write failure.
    #[error("transport io: {0}")]
    Io(String),

    /// An inbound frame exceeded the configured size cap.
    #[error("frame of {got} bytes exceeds cap of {cap}")]
    FrameTooLarge {
        /// Declared frame length.
        got: usize,
        /// Configured cap.
        cap: usize,
    },

    /// An inbound frame was not valid UTF-8 JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl TransportError {
    /// Map onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::FrameTooLarge { .. } | Self::Malformed(_) => ErrorKind::InvalidArgument,
        }
    }
}

impl From<TransportError> for KsiError {
    fn from(e: TransportError) -> Self {
        KsiError::new(e.kind(), e.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
