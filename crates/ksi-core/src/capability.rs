//! Capability names and sets.
//!
//! A capability is a named right an agent must hold before the router will
//! dispatch certain events on its behalf. An agent's active set is computed
//! at spawn time from its composition plus any grants from its parent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named right (e.g. `spawn_agents`, `completion.any`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    /// Right to spawn child agents.
    #[must_use]
    pub fn spawn_agents() -> Self {
        Self("spawn_agents".to_owned())
    }

    /// Right to start and terminate orchestrations.
    #[must_use]
    pub fn orchestrate() -> Self {
        Self("orchestrate".to_owned())
    }

    /// Right to mutate shared graph state.
    #[must_use]
    pub fn state_write() -> Self {
        Self("state_write".to_owned())
    }

    /// Right to run completions on behalf of any agent.
    #[must_use]
    pub fn completion_any() -> Self {
        Self("completion.any".to_owned())
    }

    /// Right to swap the transformer rule set.
    #[must_use]
    pub fn transformer_reload() -> Self {
        Self("transformer_reload".to_owned())
    }

    /// View the capability name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An agent's active set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// The empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set holds `capability`.
    #[must_use]
    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    /// Add a capability. Returns `true` if it was newly added.
    pub fn grant(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    /// Remove a capability. Returns `true` if it was present.
    pub fn revoke(&mut self, capability: &Capability) -> bool {
        self.0.remove(capability)
    }

    /// Union with another set (parental grants on top of composition).
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Number of capabilities held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the held capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_contains() {
        let mut set = CapabilitySet::new();
        assert!(!set.contains(&Capability::spawn_agents()));
        assert!(set.grant(Capability::spawn_agents()));
        assert!(!set.grant(Capability::spawn_agents()));
        assert!(set.contains(&Capability::spawn_agents()));
    }

    #[test]
    fn test_union_merges_parent_grants() {
        let composition: CapabilitySet = [Capability::state_write()].into_iter().collect();
        let grants: CapabilitySet = [Capability::spawn_agents()].into_iter().collect();
        let active = composition.union(&grants);
        assert!(active.contains(&Capability::state_write()));
        assert!(active.contains(&Capability::spawn_agents()));
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let set: CapabilitySet = [Capability::orchestrate(), Capability::completion_any()]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
