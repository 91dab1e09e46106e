//! Topology graph — neighbor announcements and confirmed-edge routing
//!
//! Every node periodically announces its direct neighbors. An edge {a, b} is
//! only *confirmed* when the latest announcements of both a and b list each
//! other; a single stale or malicious node can therefore declare edges but
//! never get them used for routing. Announcements apply monotonically on
//! timestamp, so reordered delivery cannot roll a node's neighbor set back.

use crate::protocol::{NodeId, MAX_ROUTE_HOPS};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct NodeState {
    declared_neighbors: HashSet<NodeId>,
    /// Timestamp of the announcement that produced `declared_neighbors`.
    announced_at_ms: u64,
    /// Local receive time, used for staleness pruning.
    last_seen_ms: u64,
}

/// In-memory graph of announced nodes and their declared neighbors.
#[derive(Debug, Default)]
pub struct TopologyGraph {
    nodes: HashMap<NodeId, NodeState>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a neighbor announcement. Returns false when the announcement is
    /// older than what we already hold (reordered delivery) and was ignored.
    pub fn apply_announcement(
        &mut self,
        node: NodeId,
        neighbors: &[NodeId],
        announced_at_ms: u64,
        now_ms: u64,
    ) -> bool {
        let truncated: HashSet<NodeId> = neighbors
            .iter()
            .copied()
            .filter(|n| *n != node)
            .take(MAX_ROUTE_HOPS)
            .collect();

        match self.nodes.get_mut(&node) {
            Some(state) => {
                if announced_at_ms < state.announced_at_ms {
                    // Still proof of life, just not newer neighbor data.
                    state.last_seen_ms = now_ms.max(state.last_seen_ms);
                    return false;
                }
                state.declared_neighbors = truncated;
                state.announced_at_ms = announced_at_ms;
                state.last_seen_ms = now_ms;
            }
            None => {
                self.nodes.insert(
                    node,
                    NodeState {
                        declared_neighbors: truncated,
                        announced_at_ms,
                        last_seen_ms: now_ms,
                    },
                );
            }
        }
        true
    }

    /// Drop a node immediately (explicit LEAVE).
    pub fn remove_node(&mut self, node: &NodeId) -> bool {
        self.nodes.remove(node).is_some()
    }

    /// An edge is confirmed only when both sides' latest announcements
    /// declare each other.
    pub fn is_edge_confirmed(&self, a: &NodeId, b: &NodeId) -> bool {
        let a_declares = self
            .nodes
            .get(a)
            .is_some_and(|s| s.declared_neighbors.contains(b));
        let b_declares = self
            .nodes
            .get(b)
            .is_some_and(|s| s.declared_neighbors.contains(a));
        a_declares && b_declares
    }

    /// Confirmed neighbors of a node.
    pub fn confirmed_neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        let Some(state) = self.nodes.get(node) else {
            return Vec::new();
        };
        state
            .declared_neighbors
            .iter()
            .filter(|n| self.is_edge_confirmed(node, n))
            .copied()
            .collect()
    }

    /// Breadth-first shortest path over confirmed edges only. The returned
    /// path includes both endpoints.
    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![*from]);
        }
        let mut visited: HashSet<NodeId> = HashSet::from([*from]);
        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue: VecDeque<NodeId> = VecDeque::from([*from]);

        while let Some(current) = queue.pop_front() {
            for next in self.confirmed_neighbors(&current) {
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, current);
                if next == *to {
                    let mut path = vec![next];
                    let mut cursor = next;
                    while let Some(prev) = parent.get(&cursor) {
                        path.push(*prev);
                        cursor = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Evict nodes unseen for longer than `stale_ms`. Edges depending on an
    /// evicted node disappear with it. Returns how many nodes were pruned.
    pub fn prune_stale(&mut self, now_ms: u64, stale_ms: u64) -> usize {
        let before = self.nodes.len();
        self.nodes
            .retain(|_, state| now_ms.saturating_sub(state.last_seen_ms) < stale_ms);
        before - self.nodes.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    /// Declared (possibly unconfirmed) neighbors, for diagnostics. Routing
    /// never uses these directly.
    pub fn declared_neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node)
            .map(|s| s.declared_neighbors.iter().copied().collect())
            .unwrap_or_default()
    }
}
