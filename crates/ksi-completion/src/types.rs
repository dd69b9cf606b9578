//! Request and session records persisted through the store.

use chrono::{DateTime, Utc};
use ksi_core::{AgentId, RequestId, SessionId};
use serde::{Deserialize, Serialize};

/// Lifecycle of one completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Tracked, waiting in a session queue.
    Pending,
    /// A worker is driving the provider call.
    Active,
    /// Terminal: the provider answered.
    Completed,
    /// Terminal: retries exhausted, non-retryable failure, or abandoned.
    Failed,
    /// Terminal: cancelled before completion.
    Cancelled,
}

impl RequestStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One outstanding (or finished) completion request.
///
/// `session_id` starts as the session the caller wants to continue — or
/// `None` for a new conversation — and is overwritten with whatever the
/// provider returns. No code path here invents one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Request id (caller-supplied or generated at tracking time).
    pub request_id: RequestId,
    /// Agent the completion runs for, if any.
    pub agent_id: Option<AgentId>,
    /// Effective session; `None` until the provider has answered once.
    pub session_id: Option<SessionId>,
    /// Lifecycle state.
    pub status: RequestStatus,
    /// Tracking time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Provider attempts made so far.
    pub attempts: u32,
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Prompt string or messages array.
    pub prompt: serde_json::Value,
    /// Provider options, passed through.
    pub options: serde_json::Value,
    /// Failure kind for terminal failures (`restart_abandoned`,
    /// `provider_error`, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Exclusive hold on a session while one request runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    /// Request currently holding the session.
    pub holder: RequestId,
    /// When the hold lapses even without a release.
    pub expires_at: DateTime<Utc>,
}

/// One provider-minted conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The provider's session id.
    pub session_id: SessionId,
    /// Agent currently owning the conversation, if any.
    pub agent_id: Option<AgentId>,
    /// Last time a request touched the session.
    pub last_activity: DateTime<Utc>,
    /// Active lock, if a request is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<SessionLock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Active.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_wire_form() {
        let json = serde_json::to_string(&RequestStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }
}
