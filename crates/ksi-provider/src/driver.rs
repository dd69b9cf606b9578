//! Driver trait and request/reply types.

use async_trait::async_trait;
use ksi_core::{ErrorKind, KsiError, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One completion request handed to a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Provider name the request targets.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Prompt string or messages array, passed through as-is.
    pub prompt: serde_json::Value,
    /// Session to continue, when the conversation already exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Provider-specific options, passed through as-is.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

/// Terminal success from a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    /// The session id the provider minted (or echoed) for this turn.
    pub session_id: SessionId,
    /// The completion result payload.
    pub result: serde_json::Value,
    /// Token accounting.
    pub usage: ProviderUsage,
}

/// Terminal failure from a driver.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider did not answer in time.
    #[error("provider timed out: {0}")]
    Timeout(String),

    /// Transient failure (network, rate limit); worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Non-retryable provider failure.
    #[error("provider failure: {0}")]
    Failed(String),

    /// The call was cancelled through its token.
    #[error("provider call cancelled")]
    Cancelled,

    /// Process or pipe level failure.
    #[error("provider io: {0}")]
    Io(String),
}

impl ProviderError {
    /// Whether the completion service should retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_) | Self::Io(_))
    }

    /// Map onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Transient(_) | Self::Failed(_) => ErrorKind::ProviderError,
        }
    }
}

impl From<ProviderError> for KsiError {
    fn from(e: ProviderError) -> Self {
        let retryable = e.is_retryable();
        KsiError::new(e.kind(), e.to_string()).retryable(retryable)
    }
}

/// The seam the completion worker drives.
///
/// `run` executes one request end-to-end: progress updates flow through
/// `progress` while the call is in flight, and the return value is the
/// terminal outcome. Implementations observe `cancel` at every await and
/// abort the underlying call when it fires.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Driver name (matches `ProviderRequest::provider`).
    fn name(&self) -> &str;

    /// Run one completion to its terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] classified by retryability.
    async fn run(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<ProviderReply, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(ProviderError::Timeout("t".into()).is_retryable());
        assert!(ProviderError::Transient("rate limited".into()).is_retryable());
        assert!(ProviderError::Io("pipe".into()).is_retryable());
        assert!(!ProviderError::Failed("bad model".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ProviderError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ProviderError::Failed("x".into()).kind(),
            ErrorKind::ProviderError
        );
    }
}
