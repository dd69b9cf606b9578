//! Agent lifecycle states.

use serde::{Deserialize, Serialize};

/// State machine per agent.
///
/// `Running` and `Idle` are derived, not stored: an agent whose stored
/// lifecycle state is `Ready` reports `Running` whenever any of its
/// requests is in flight and `Idle` otherwise. Stored transitions only
/// move forward: `Spawning → Ready → Terminating → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Composition resolved, sandbox being allocated.
    Spawning,
    /// Live and able to take messages.
    Ready,
    /// A request is in flight for the agent (derived).
    Running,
    /// Live with nothing in flight (derived).
    Idle,
    /// Terminate requested; in-flight requests being cancelled.
    Terminating,
    /// Final state.
    Terminated,
}

impl AgentState {
    /// Whether messages may still be delivered.
    #[must_use]
    pub fn accepts_messages(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }

    /// Whether the agent has reached (or is heading to) its end state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_acceptance() {
        assert!(AgentState::Ready.accepts_messages());
        assert!(AgentState::Running.accepts_messages());
        assert!(!AgentState::Terminating.accepts_messages());
        assert!(!AgentState::Spawning.accepts_messages());
    }

    #[test]
    fn test_wire_form() {
        assert_eq!(
            serde_json::to_string(&AgentState::Terminating).unwrap(),
            "\"terminating\""
        );
    }
}
