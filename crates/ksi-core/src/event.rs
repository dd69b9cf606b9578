//! The event envelope.
//!
//! An [`Event`] is the universal message: a validated name, a JSON data
//! object, and a system-managed [`EventContext`]. Context is written only
//! by the router; everything else reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KsiError;
use crate::id::{AgentId, ClientId, CorrelationId, EventId, OrchestrationId};

// ---------------------------------------------------------------------------
// EventName
// ---------------------------------------------------------------------------

/// A validated event name of the form `namespace:verb`.
///
/// Both parts are non-empty, ASCII lower-case `[a-z0-9_]`. Anything else is
/// rejected at parse time so the registry never sees a malformed name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    /// Parse and validate an event name.
    ///
    /// # Errors
    ///
    /// Returns `invalid_argument` if the name is not `namespace:verb` with
    /// both parts ASCII lower-case `[a-z0-9_]`.
    pub fn parse(name: &str) -> Result<Self, KsiError> {
        let Some((ns, verb)) = name.split_once(':') else {
            return Err(KsiError::invalid_argument(format!(
                "event name {name:?} is not namespace:verb"
            )));
        };
        if ns.is_empty() || verb.is_empty() || !is_name_part(ns) || !is_name_part(verb) {
            return Err(KsiError::invalid_argument(format!(
                "event name {name:?} must be lower-case [a-z0-9_]+:[a-z0-9_]+"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// The full `namespace:verb` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the colon.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map_or("", |(ns, _)| ns)
    }

    /// The part after the colon.
    #[must_use]
    pub fn verb(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, verb)| verb)
    }
}

fn is_name_part(part: &str) -> bool {
    part.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EventName {
    type Err = KsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// EventContext
// ---------------------------------------------------------------------------

/// System-managed context stamped on every dispatched event.
///
/// Set on ingress by the router and never trusted from the wire. At depth 0
/// the `root_event_id` equals `event_id` and `parent_event_id` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    /// Unique id of this dispatch.
    pub event_id: EventId,
    /// Dispatch timestamp.
    pub timestamp: DateTime<Utc>,
    /// Shared by every event in one causal chain.
    pub correlation_id: CorrelationId,
    /// The event whose handler emitted this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    /// The first event of the chain.
    pub root_event_id: EventId,
    /// Distance from the chain root.
    pub depth: u32,
    /// The agent the event originated from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// The transport connection the event originated from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// The orchestration the originating entity belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration_id: Option<OrchestrationId>,
    /// Nesting depth of that orchestration below the tree root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration_depth: Option<u32>,
    /// The topmost orchestration of the tree, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_orchestration_id: Option<OrchestrationId>,
}

impl EventContext {
    /// Context for an event entering the system from outside any chain.
    #[must_use]
    pub fn root() -> Self {
        let event_id = EventId::new();
        Self {
            root_event_id: event_id.clone(),
            event_id,
            timestamp: Utc::now(),
            correlation_id: CorrelationId::new(),
            parent_event_id: None,
            depth: 0,
            agent_id: None,
            client_id: None,
            orchestration_id: None,
            orchestration_depth: None,
            root_orchestration_id: None,
        }
    }

    /// Context for an event emitted while handling `parent`.
    ///
    /// Inherits the correlation id and the orchestration chain; the parent's
    /// `event_id` becomes `parent_event_id`; depth increases by one.
    #[must_use]
    pub fn child_of(parent: &Self) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            correlation_id: parent.correlation_id.clone(),
            parent_event_id: Some(parent.event_id.clone()),
            root_event_id: parent.root_event_id.clone(),
            depth: parent.depth.saturating_add(1),
            agent_id: parent.agent_id.clone(),
            client_id: parent.client_id.clone(),
            orchestration_id: parent.orchestration_id.clone(),
            orchestration_depth: parent.orchestration_depth,
            root_orchestration_id: parent.root_orchestration_id.clone(),
        }
    }

    /// Attach the originating client.
    #[must_use]
    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Attach the originating agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Attach the orchestration chain.
    #[must_use]
    pub fn with_orchestration(
        mut self,
        orchestration_id: OrchestrationId,
        depth: u32,
        root: OrchestrationId,
    ) -> Self {
        self.orchestration_id = Some(orchestration_id);
        self.orchestration_depth = Some(depth);
        self.root_orchestration_id = Some(root);
        self
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The universal message dispatched through the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Validated `namespace:verb` name.
    #[serde(rename = "event")]
    pub name: EventName,
    /// JSON payload object.
    pub data: serde_json::Value,
    /// System-managed context.
    pub context: EventContext,
}

impl Event {
    /// Build an event with the given context.
    #[must_use]
    pub fn new(name: EventName, data: serde_json::Value, context: EventContext) -> Self {
        Self {
            name,
            data,
            context,
        }
    }
}

/// Where an event entered the system.
///
/// The router uses this to stamp context and to decide whether capability
/// enforcement applies (agent-originated events are gated; system-originated
/// events are not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOrigin {
    /// A transport connection.
    Client(ClientId),
    /// An agent (its capability set gates dispatch).
    Agent(AgentId),
    /// The daemon itself.
    System,
}

impl EventOrigin {
    /// The agent behind this origin, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            Self::Client(_) | Self::System => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_accepts_namespace_verb() {
        let name = EventName::parse("completion:async").unwrap();
        assert_eq!(name.namespace(), "completion");
        assert_eq!(name.verb(), "async");
    }

    #[test]
    fn test_event_name_rejects_malformed() {
        assert!(EventName::parse("nocolon").is_err());
        assert!(EventName::parse("Upper:case").is_err());
        assert!(EventName::parse("two:colons:here").is_err());
        assert!(EventName::parse(":verb").is_err());
        assert!(EventName::parse("ns:").is_err());
        assert!(EventName::parse("ns:has space").is_err());
    }

    #[test]
    fn test_root_context_invariant() {
        let ctx = EventContext::root();
        assert_eq!(ctx.root_event_id, ctx.event_id);
        assert_eq!(ctx.depth, 0);
        assert!(ctx.parent_event_id.is_none());
    }

    #[test]
    fn test_child_context_causality() {
        let parent = EventContext::root().with_agent(AgentId::from("a1"));
        let child = EventContext::child_of(&parent);
        assert_eq!(child.parent_event_id.as_ref(), Some(&parent.event_id));
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.root_event_id, parent.root_event_id);
        assert_eq!(child.depth, parent.depth + 1);
        assert_eq!(child.agent_id, parent.agent_id);
    }

    #[test]
    fn test_event_name_deserialize_validates() {
        let ok: Result<EventName, _> = serde_json::from_str("\"agent:spawn\"");
        assert!(ok.is_ok());
        let bad: Result<EventName, _> = serde_json::from_str("\"BAD NAME\"");
        assert!(bad.is_err());
    }
}
