//! Relay engine — the per-packet deliver/forward/flood decision
//!
//! Decision ladder for every non-local packet:
//! 1. duplicate identity → drop
//! 2. addressed to us (or broadcast) → deliver; broadcasts also continue
//! 3. ttl exhausted → no relay
//! 4. source route present → unicast to the next hop, falling back to flood
//!    when that hop has no live link (delivery beats topology efficiency;
//!    the dedup cache absorbs the duplicate this can cause)
//! 5. otherwise flood, with probabilistic suppression in dense
//!    neighborhoods to bound storm amplification
//!
//! The engine re-serializes forwarded packets with TTL decremented and every
//! other byte unchanged; signatures stay valid because the signing digest
//! normalizes TTL.

use crate::protocol::{packet_id, Envelope, NodeId, PacketId, VERSION_2};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};

/// Outcome of processing an incoming envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Deliver locally; no relay.
    Deliver,
    /// Unicast to the next hop of the source route.
    Forward { next_hop: NodeId },
    /// Rebroadcast with TTL decremented; `deliver_local` is set for
    /// broadcasts, which we both consume and relay.
    Flood { deliver_local: bool },
    /// Drop without delivery.
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Identity already seen within the dedup window.
    Duplicate,
    /// TTL reached zero and the packet is not for us.
    TtlExpired,
    /// Source route does not contain us.
    NotOnRoute,
}

/// Time- and capacity-bounded set of recently seen packet identities.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<PacketId, u64>,
    order: VecDeque<(PacketId, u64)>,
    capacity: usize,
    window_ms: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            window_ms,
        }
    }

    /// Record an identity. Returns true when it was not already present
    /// within the window.
    pub fn check_and_insert(&mut self, id: PacketId, now_ms: u64) -> bool {
        self.evict(now_ms);
        match self.seen.get(&id) {
            Some(seen_at) if now_ms.saturating_sub(*seen_at) < self.window_ms => false,
            _ => {
                self.seen.insert(id, now_ms);
                self.order.push_back((id, now_ms));
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now_ms: u64) {
        while let Some((id, inserted_at)) = self.order.front().copied() {
            let expired = now_ms.saturating_sub(inserted_at) >= self.window_ms;
            if !expired && self.seen.len() < self.capacity {
                break;
            }
            self.order.pop_front();
            // Only remove the map entry if it still refers to this insertion
            // (the id may have been refreshed after expiry).
            if self.seen.get(&id) == Some(&inserted_at) {
                self.seen.remove(&id);
            }
        }
    }
}

/// Per-packet relay decision engine.
pub struct RelayEngine {
    local_id: NodeId,
    dedup: DedupCache,
    suppression_probability: f64,
    suppression_min_neighbors: usize,
}

impl RelayEngine {
    pub fn new(
        local_id: NodeId,
        dedup_capacity: usize,
        dedup_window_ms: u64,
        suppression_probability: f64,
        suppression_min_neighbors: usize,
    ) -> Self {
        Self {
            local_id,
            dedup: DedupCache::new(dedup_capacity, dedup_window_ms),
            suppression_probability,
            suppression_min_neighbors,
        }
    }

    /// Decide what to do with an inbound envelope. `live_neighbors` is the
    /// set of node ids currently reachable over an established link.
    pub fn decide(
        &mut self,
        envelope: &Envelope,
        live_neighbors: &HashSet<NodeId>,
        now_ms: u64,
    ) -> RelayDecision {
        let id = packet_id(envelope);
        if !self.dedup.check_and_insert(id, now_ms) {
            return RelayDecision::Drop(DropReason::Duplicate);
        }

        if envelope.recipient == Some(self.local_id) {
            return RelayDecision::Deliver;
        }

        if envelope.ttl == 0 {
            // TTL-zero broadcasts are still consumed locally; sync re-sends
            // arrive exactly like this and must not propagate further.
            return if envelope.is_broadcast() {
                RelayDecision::Deliver
            } else {
                RelayDecision::Drop(DropReason::TtlExpired)
            };
        }

        if envelope.version >= VERSION_2
            && !envelope.route.is_empty()
            && envelope.recipient.is_some()
        {
            return self.decide_routed(envelope, live_neighbors);
        }

        if envelope.is_broadcast() {
            let suppressed = live_neighbors.len() >= self.suppression_min_neighbors
                && rand::thread_rng().gen::<f64>() >= self.suppression_probability;
            if suppressed {
                tracing::debug!(neighbors = live_neighbors.len(), "flood suppressed");
                return RelayDecision::Deliver;
            }
            return RelayDecision::Flood {
                deliver_local: true,
            };
        }

        // Unicast for someone else with no usable route: flood it onward.
        RelayDecision::Flood {
            deliver_local: false,
        }
    }

    fn decide_routed(
        &self,
        envelope: &Envelope,
        live_neighbors: &HashSet<NodeId>,
    ) -> RelayDecision {
        let Some(position) = envelope.route.iter().position(|hop| *hop == self.local_id) else {
            // A route we are not on is malformed or not meant for us.
            return RelayDecision::Drop(DropReason::NotOnRoute);
        };

        let next_hop = envelope
            .route
            .get(position + 1)
            .copied()
            .or(envelope.recipient)
            .expect("recipient checked by caller");

        if live_neighbors.contains(&next_hop) {
            RelayDecision::Forward { next_hop }
        } else {
            // Preserve delivery over topology efficiency; dedup absorbs any
            // duplicate from a stale-route attempt racing the flood.
            tracing::debug!(next_hop = %hex::encode(next_hop), "route hop unreachable, flooding");
            RelayDecision::Flood {
                deliver_local: false,
            }
        }
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    const LOCAL: NodeId = [9u8; 8];

    fn engine() -> RelayEngine {
        RelayEngine::new(LOCAL, 1024, 300_000, 1.0, 4)
    }

    fn neighbors(ids: &[u8]) -> HashSet<NodeId> {
        ids.iter().map(|v| [*v; 8]).collect()
    }

    fn broadcast(ttl: u8) -> Envelope {
        Envelope::broadcast(MessageType::Message, [1u8; 8], 1000, ttl, b"m".to_vec())
    }

    #[test]
    fn test_broadcast_floods_and_delivers() {
        let mut engine = engine();
        let decision = engine.decide(&broadcast(3), &neighbors(&[1, 2]), 0);
        assert_eq!(
            decision,
            RelayDecision::Flood {
                deliver_local: true
            }
        );
    }

    #[test]
    fn test_second_delivery_is_duplicate() {
        let mut engine = engine();
        let env = broadcast(3);
        let n = neighbors(&[1]);
        assert!(matches!(
            engine.decide(&env, &n, 0),
            RelayDecision::Flood { .. }
        ));
        assert_eq!(
            engine.decide(&env, &n, 1),
            RelayDecision::Drop(DropReason::Duplicate)
        );
        // A relayed copy (only TTL differs) shares the identity
        assert_eq!(
            engine.decide(&env.with_ttl(1), &n, 2),
            RelayDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_unicast_to_self_delivers() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], LOCAL, 1000, 3, vec![]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[1]), 0),
            RelayDecision::Deliver
        );
    }

    #[test]
    fn test_ttl_zero_broadcast_delivered_not_relayed() {
        let mut engine = engine();
        assert_eq!(
            engine.decide(&broadcast(0), &neighbors(&[1]), 0),
            RelayDecision::Deliver
        );
    }

    #[test]
    fn test_ttl_zero_foreign_unicast_dropped() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [2; 8], 1000, 0, vec![]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[1, 2]), 0),
            RelayDecision::Drop(DropReason::TtlExpired)
        );
    }

    #[test]
    fn test_route_forward_to_next_hop() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [4; 8], 1000, 5, vec![])
            .with_route(vec![LOCAL, [3u8; 8]]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[3]), 0),
            RelayDecision::Forward { next_hop: [3u8; 8] }
        );
    }

    #[test]
    fn test_route_last_hop_forwards_to_recipient() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [4; 8], 1000, 5, vec![])
            .with_route(vec![[2u8; 8], LOCAL]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[4]), 0),
            RelayDecision::Forward { next_hop: [4u8; 8] }
        );
    }

    #[test]
    fn test_route_without_us_dropped() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [4; 8], 1000, 5, vec![])
            .with_route(vec![[2u8; 8], [3u8; 8]]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[2, 3, 4]), 0),
            RelayDecision::Drop(DropReason::NotOnRoute)
        );
    }

    #[test]
    fn test_dead_next_hop_falls_back_to_flood() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [4; 8], 1000, 5, vec![])
            .with_route(vec![LOCAL, [3u8; 8]]);
        // Node 3 has no live link
        assert_eq!(
            engine.decide(&env, &neighbors(&[2]), 0),
            RelayDecision::Flood {
                deliver_local: false
            }
        );
    }

    #[test]
    fn test_foreign_unicast_floods_without_delivery() {
        let mut engine = engine();
        let env = Envelope::direct(MessageType::Message, [1; 8], [7; 8], 1000, 3, vec![]);
        assert_eq!(
            engine.decide(&env, &neighbors(&[1]), 0),
            RelayDecision::Flood {
                deliver_local: false
            }
        );
    }

    #[test]
    fn test_suppression_never_skips_delivery() {
        // p=0: every dense-neighborhood flood is suppressed to local delivery
        let mut engine = RelayEngine::new(LOCAL, 1024, 300_000, 0.0, 2);
        let decision = engine.decide(&broadcast(5), &neighbors(&[1, 2, 3]), 0);
        assert_eq!(decision, RelayDecision::Deliver);
    }

    #[test]
    fn test_suppression_inactive_below_neighbor_floor() {
        let mut engine = RelayEngine::new(LOCAL, 1024, 300_000, 0.0, 4);
        let decision = engine.decide(&broadcast(5), &neighbors(&[1, 2]), 0);
        assert_eq!(
            decision,
            RelayDecision::Flood {
                deliver_local: true
            }
        );
    }

    #[test]
    fn test_dedup_cache_capacity_bound() {
        let mut cache = DedupCache::new(3, 1_000_000);
        for i in 0..10u8 {
            assert!(cache.check_and_insert([i; 16], i as u64));
        }
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_dedup_cache_window_expiry() {
        let mut cache = DedupCache::new(100, 1000);
        assert!(cache.check_and_insert([1; 16], 0));
        assert!(!cache.check_and_insert([1; 16], 500));
        // Past the window the identity counts as new again
        assert!(cache.check_and_insert([1; 16], 2000));
    }
}
