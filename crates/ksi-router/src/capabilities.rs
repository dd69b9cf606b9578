//! Live index of agent capability sets.
//!
//! The agent service writes an agent's resolved set here at spawn and
//! removes it at termination; the dispatch loop consults it before any
//! agent-attributed event reaches a handler that declares a required
//! capability. Enforcement keys off the event *context*, so events a
//! transformer synthesized from an agent-originated input are gated the
//! same as the original.

use dashmap::DashMap;
use ksi_core::{AgentId, Capability, CapabilitySet};

/// Shared agent-id → capability-set index.
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    sets: DashMap<AgentId, CapabilitySet>,
}

impl CapabilityIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) an agent's active set.
    pub fn bind(&self, agent_id: AgentId, set: CapabilitySet) {
        self.sets.insert(agent_id, set);
    }

    /// Drop an agent's set (termination).
    pub fn unbind(&self, agent_id: &AgentId) {
        self.sets.remove(agent_id);
    }

    /// Whether `agent_id` currently holds `capability`.
    ///
    /// Unknown agents hold nothing (fail-secure).
    #[must_use]
    pub fn holds(&self, agent_id: &AgentId, capability: &Capability) -> bool {
        self.sets
            .get(agent_id)
            .is_some_and(|set| set.contains(capability))
    }

    /// Snapshot an agent's set, if registered.
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<CapabilitySet> {
        self.sets.get(agent_id).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_agent_holds_nothing() {
        let index = CapabilityIndex::new();
        assert!(!index.holds(&AgentId::from("ghost"), &Capability::spawn_agents()));
    }

    #[test]
    fn test_bind_and_unbind() {
        let index = CapabilityIndex::new();
        let agent = AgentId::from("a1");
        index.bind(
            agent.clone(),
            [Capability::spawn_agents()].into_iter().collect(),
        );
        assert!(index.holds(&agent, &Capability::spawn_agents()));
        assert!(!index.holds(&agent, &Capability::orchestrate()));
        index.unbind(&agent);
        assert!(!index.holds(&agent, &Capability::spawn_agents()));
    }
}
