//! Live index of orchestration trees for bubble-up delivery.
//!
//! The orchestration service registers every started orchestration here
//! (parent link, subscription levels, orchestrator delivery queue) and
//! binds member agents. The dispatch loop reads the index on its hot
//! path: stamping orchestration context on agent-originated ingress and
//! walking ancestors for bubble-up — no store round-trips.

use std::sync::Arc;

use dashmap::DashMap;
use ksi_core::{AgentId, OrchestrationId};

use crate::subscription::DeliveryQueue;

/// One orchestration's routing state.
#[derive(Debug, Clone)]
pub struct OrchNode {
    /// Parent orchestration, when nested.
    pub parent: Option<OrchestrationId>,
    /// How many relative levels of ordinary events the orchestrator hears
    /// (`-1` = all).
    pub event_level: i32,
    /// How many relative levels of error events the orchestrator hears
    /// (`-1` = all).
    pub error_level: i32,
    /// Where bubbled events are delivered.
    pub queue: Arc<DeliveryQueue>,
}

/// Shared orchestration-tree index.
#[derive(Debug, Default)]
pub struct OrchestrationIndex {
    nodes: DashMap<OrchestrationId, OrchNode>,
    agents: DashMap<AgentId, OrchestrationId>,
}

impl OrchestrationIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a started orchestration.
    pub fn register(&self, id: OrchestrationId, node: OrchNode) {
        self.nodes.insert(id, node);
    }

    /// Remove a terminated orchestration and close its delivery queue.
    pub fn remove(&self, id: &OrchestrationId) {
        if let Some((_, node)) = self.nodes.remove(id) {
            node.queue.close();
        }
    }

    /// Bind an agent to its owning orchestration.
    pub fn bind_agent(&self, agent_id: AgentId, orchestration_id: OrchestrationId) {
        self.agents.insert(agent_id, orchestration_id);
    }

    /// Unbind a terminated agent.
    pub fn unbind_agent(&self, agent_id: &AgentId) {
        self.agents.remove(agent_id);
    }

    /// Snapshot a node.
    #[must_use]
    pub fn get(&self, id: &OrchestrationId) -> Option<OrchNode> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// The orchestration an agent belongs to, if any.
    #[must_use]
    pub fn orchestration_of(&self, agent_id: &AgentId) -> Option<OrchestrationId> {
        self.agents.get(agent_id).map(|o| o.value().clone())
    }

    /// `(depth below root, root id)` for an orchestration.
    ///
    /// Walks parent links; cycle-capped defensively even though
    /// `parent_of` is store-enforced as a forest.
    #[must_use]
    pub fn chain_position(&self, id: &OrchestrationId) -> (u32, OrchestrationId) {
        let mut depth = 0;
        let mut current = id.clone();
        for _ in 0..1024 {
            match self.get(&current).and_then(|n| n.parent) {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                },
                None => break,
            }
        }
        (depth, current)
    }

    /// Ancestors of `id` from itself upward: `(orchestration, steps up)`.
    #[must_use]
    pub fn ancestors(&self, id: &OrchestrationId) -> Vec<(OrchestrationId, u32)> {
        let mut out = Vec::new();
        let mut current = Some(id.clone());
        let mut steps = 0;
        while let Some(id) = current {
            let node = self.get(&id);
            out.push((id, steps));
            steps += 1;
            current = node.and_then(|n| n.parent);
            if steps > 1024 {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(parent: Option<&OrchestrationId>) -> OrchNode {
        OrchNode {
            parent: parent.cloned(),
            event_level: 1,
            error_level: -1,
            queue: DeliveryQueue::new(8),
        }
    }

    #[test]
    fn test_chain_position_and_ancestors() {
        let index = OrchestrationIndex::new();
        let root = OrchestrationId::from("root");
        let mid = OrchestrationId::from("mid");
        let leaf = OrchestrationId::from("leaf");
        index.register(root.clone(), node(None));
        index.register(mid.clone(), node(Some(&root)));
        index.register(leaf.clone(), node(Some(&mid)));

        assert_eq!(index.chain_position(&leaf), (2, root.clone()));
        assert_eq!(index.chain_position(&root), (0, root.clone()));

        let ancestors = index.ancestors(&leaf);
        assert_eq!(ancestors.len(), 3);
        assert_eq!(ancestors[0], (leaf.clone(), 0));
        assert_eq!(ancestors[2], (root.clone(), 2));
    }

    #[test]
    fn test_agent_binding() {
        let index = OrchestrationIndex::new();
        let orch = OrchestrationId::from("o1");
        let agent = AgentId::from("a1");
        index.register(orch.clone(), node(None));
        index.bind_agent(agent.clone(), orch.clone());
        assert_eq!(index.orchestration_of(&agent), Some(orch));
        index.unbind_agent(&agent);
        assert!(index.orchestration_of(&agent).is_none());
    }

    #[test]
    fn test_remove_closes_queue() {
        let index = OrchestrationIndex::new();
        let orch = OrchestrationId::from("o1");
        let n = node(None);
        let queue = Arc::clone(&n.queue);
        index.register(orch.clone(), n);
        index.remove(&orch);
        assert!(queue.is_closed());
    }
}
