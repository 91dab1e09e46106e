//! Retained-packet store — the candidate set anti-entropy sync reconciles
//!
//! Holds the original encoded bytes of recently seen broadcast traffic plus
//! the single latest announcement per sender. Keeping the received bytes
//! (not a re-encoding) means a sync re-send is byte-identical to the
//! original apart from the forced TTL, so its signature stays valid.
//!
//! Age, count, and byte budgets are all enforced; under adversarial flooding
//! the store degrades by evicting the oldest broadcasts, never by growing.

use crate::protocol::{packet_id, Envelope, MessageType, NodeId, PacketId};
use std::collections::{HashMap, VecDeque};

/// One retained packet: identity, enough metadata to build sync candidates,
/// and the original wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPacket {
    pub id: PacketId,
    pub msg_type: MessageType,
    pub sender: NodeId,
    pub timestamp_ms: u64,
    pub stored_at_ms: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct PacketStore {
    /// Broadcast messages in insertion order (front = oldest).
    broadcasts: HashMap<PacketId, StoredPacket>,
    broadcast_order: VecDeque<PacketId>,
    /// Latest announcement per sender.
    announces: HashMap<NodeId, StoredPacket>,
    retention_ms: u64,
    max_packets: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl PacketStore {
    pub fn new(retention_ms: u64, max_packets: usize, max_bytes: usize) -> Self {
        Self {
            retention_ms,
            max_packets: max_packets.max(1),
            max_bytes,
            ..Default::default()
        }
    }

    /// Insert a gossip-tracked envelope with its original wire bytes.
    /// Returns false for duplicates and untracked types.
    pub fn insert(&mut self, envelope: &Envelope, bytes: Vec<u8>, now_ms: u64) -> bool {
        if !envelope.is_gossip_tracked() {
            return false;
        }
        let id = packet_id(envelope);
        let packet = StoredPacket {
            id,
            msg_type: envelope.msg_type,
            sender: envelope.sender,
            timestamp_ms: envelope.timestamp_ms,
            stored_at_ms: now_ms,
            bytes,
        };

        if envelope.msg_type == MessageType::Announce {
            // Latest per sender only; an older announce never displaces newer.
            if let Some(existing) = self.announces.get(&envelope.sender) {
                if existing.timestamp_ms >= packet.timestamp_ms {
                    return false;
                }
                self.total_bytes -= existing.bytes.len();
            }
            self.total_bytes += packet.bytes.len();
            self.announces.insert(envelope.sender, packet);
            return true;
        }

        if self.broadcasts.contains_key(&id) {
            return false;
        }
        self.total_bytes += packet.bytes.len();
        self.broadcasts.insert(id, packet);
        self.broadcast_order.push_back(id);
        self.enforce_budgets();
        true
    }

    pub fn contains(&self, id: &PacketId) -> bool {
        self.broadcasts.contains_key(id) || self.announces.values().any(|p| p.id == *id)
    }

    pub fn get_broadcast(&self, id: &PacketId) -> Option<&StoredPacket> {
        self.broadcasts.get(id)
    }

    /// Sync candidates: retained broadcasts plus latest announce per sender,
    /// newest-first, limited to entries stored within the retention window
    /// and to `cap` elements.
    pub fn candidates(&self, now_ms: u64, cap: usize) -> Vec<&StoredPacket> {
        let fresh = |p: &&StoredPacket| {
            now_ms.saturating_sub(p.stored_at_ms) < self.retention_ms
        };
        let mut out: Vec<&StoredPacket> = self
            .broadcasts
            .values()
            .filter(fresh)
            .chain(self.announces.values().filter(fresh))
            .collect();
        out.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        out.truncate(cap);
        out
    }

    /// Drop entries past the retention age. Returns how many were removed.
    pub fn maintain(&mut self, now_ms: u64) -> usize {
        let retention = self.retention_ms;
        let mut removed = 0;

        let expired: Vec<PacketId> = self
            .broadcasts
            .values()
            .filter(|p| now_ms.saturating_sub(p.stored_at_ms) >= retention)
            .map(|p| p.id)
            .collect();
        for id in expired {
            if let Some(packet) = self.broadcasts.remove(&id) {
                self.total_bytes -= packet.bytes.len();
                removed += 1;
            }
        }
        self.broadcast_order.retain(|id| self.broadcasts.contains_key(id));

        let stale_senders: Vec<NodeId> = self
            .announces
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.stored_at_ms) >= retention)
            .map(|(sender, _)| *sender)
            .collect();
        for sender in stale_senders {
            if let Some(packet) = self.announces.remove(&sender) {
                self.total_bytes -= packet.bytes.len();
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.broadcasts.len() + self.announces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn enforce_budgets(&mut self) {
        while self.broadcasts.len() > self.max_packets
            || (self.max_bytes > 0 && self.total_bytes > self.max_bytes)
        {
            let Some(oldest) = self.broadcast_order.pop_front() else {
                break;
            };
            if let Some(packet) = self.broadcasts.remove(&oldest) {
                self.total_bytes -= packet.bytes.len();
            }
        }
    }
}
