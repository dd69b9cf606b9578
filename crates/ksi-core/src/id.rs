//! Newtype identifiers.
//!
//! Every addressable thing in KSI has its own id type so that an
//! `AgentId` can never be passed where a `RequestId` is expected.
//! All ids serialize as plain strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random id.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::new_v4().simple()))
            }

            /// View the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

uuid_id!(
    /// Unique id of a single dispatched event.
    EventId,
    "ev"
);

uuid_id!(
    /// Id shared by every event in one causal chain.
    CorrelationId,
    "corr"
);

uuid_id!(
    /// Id of one outstanding completion request.
    RequestId,
    "req"
);

uuid_id!(
    /// Id of an agent entity.
    AgentId,
    "agent"
);

uuid_id!(
    /// Id of an orchestration entity.
    OrchestrationId,
    "orch"
);

uuid_id!(
    /// Id derived from a transport connection.
    ClientId,
    "client"
);

uuid_id!(
    /// Stable id naming an agent's sandbox directory.
    SandboxId,
    "sbx"
);

uuid_id!(
    /// Id of one subscription (client or agent interest in a stream).
    SubscriberId,
    "sub"
);

/// A provider-minted conversation identifier.
///
/// The daemon never invents one of these: a `SessionId` only ever enters
/// the system inside a provider response, after which the session tracker
/// adopts it. There is no `new()` constructor on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// View the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_id_prefixes() {
        assert!(EventId::new().as_str().starts_with("ev_"));
        assert!(AgentId::new().as_str().starts_with("agent_"));
        assert!(OrchestrationId::new().as_str().starts_with("orch_"));
    }

    #[test]
    fn test_serde_transparent() {
        let id = AgentId::from("a1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_session_id_is_adopted_not_minted() {
        // SessionId has no generator; it can only be built from a string
        // that arrived from a provider.
        let sid = SessionId::from("provider-minted");
        assert_eq!(sid.as_str(), "provider-minted");
    }
}
