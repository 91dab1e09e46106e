//! Fragmentation engine — splitting and reassembly of oversized envelopes
//!
//! An envelope whose encoding exceeds the link MTU is split into fixed-size
//! fragments sharing a freshly generated 8-byte group id. Each fragment is
//! itself a regular envelope of type `Fragment`, whose payload is:
//!
//! ```text
//! [8] group id
//! [2] index (BE u16)
//! [2] count (BE u16)
//! [1] original message type (diagnostic only; authoritative type comes
//!     from decoding the reassembled bytes)
//! [N] slice of the parent's encoded bytes
//! ```
//!
//! If the parent carried a source route, every fragment carries an identical
//! copy of it and uses version 2 — fragments never silently fall back to
//! flood routing, which would defeat source-routing for large transfers.
//!
//! The reassembler keys partial buffers by (sender, group id), drops
//! duplicate indices idempotently, and evicts incomplete groups after a
//! bounded timeout so adversarial dribbles cannot pin memory.

use super::envelope::{Envelope, MessageType};
use super::{NodeId, ProtocolError, VERSION_2};
use std::collections::HashMap;

/// Fragment payload header: group(8) + index(2) + count(2) + orig type(1).
pub const FRAGMENT_HEADER_LEN: usize = 13;

/// A decoded fragment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub group_id: [u8; 8],
    pub index: u16,
    pub count: u16,
    pub orig_type: u8,
    pub slice: Vec<u8>,
}

impl Fragment {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.slice.len());
        buf.extend_from_slice(&self.group_id);
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.push(self.orig_type);
        buf.extend_from_slice(&self.slice);
        buf
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::BufferTooShort {
                need: FRAGMENT_HEADER_LEN,
                got: payload.len(),
            });
        }
        let mut group_id = [0u8; 8];
        group_id.copy_from_slice(&payload[0..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let count = u16::from_be_bytes([payload[10], payload[11]]);
        let orig_type = payload[12];

        if count == 0 || index >= count {
            return Err(ProtocolError::FragmentIndexOutOfRange { index, count });
        }

        Ok(Fragment {
            group_id,
            index,
            count,
            orig_type,
            slice: payload[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split an envelope's encoding into fragment envelopes no larger than
/// `max_fragment_payload` bytes of payload each.
///
/// Returns a single-element vec holding a clone of the parent when it
/// already fits.
pub fn fragment_envelope(
    parent: &Envelope,
    max_fragment_payload: usize,
) -> Result<Vec<Envelope>, ProtocolError> {
    let encoded = parent.encode()?;
    let slice_len = max_fragment_payload.saturating_sub(FRAGMENT_HEADER_LEN);
    if slice_len == 0 {
        return Err(ProtocolError::BufferTooShort {
            need: FRAGMENT_HEADER_LEN + 1,
            got: max_fragment_payload,
        });
    }
    if encoded.len() <= max_fragment_payload {
        return Ok(vec![parent.clone()]);
    }

    let count = encoded.len().div_ceil(slice_len);
    if count > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            version: parent.version,
            len: encoded.len(),
        });
    }

    let group_id: [u8; 8] = rand::random();
    let routed = !parent.route.is_empty();
    let mut fragments = Vec::with_capacity(count);

    for (index, chunk) in encoded.chunks(slice_len).enumerate() {
        let fragment = Fragment {
            group_id,
            index: index as u16,
            count: count as u16,
            orig_type: parent.msg_type.as_u8(),
            slice: chunk.to_vec(),
        };
        let mut env = Envelope {
            version: if routed { VERSION_2 } else { parent.version },
            msg_type: MessageType::Fragment,
            ttl: parent.ttl,
            timestamp_ms: parent.timestamp_ms,
            sender: parent.sender,
            recipient: parent.recipient,
            route: parent.route.clone(),
            payload: fragment.to_payload(),
            compressed: false,
            signature: None,
        };
        // v1 payload length field cannot describe jumbo slices
        if env.version == 1 && env.payload.len() > Envelope::MAX_PAYLOAD_V1 {
            env.version = VERSION_2;
        }
        fragments.push(env);
    }

    Ok(fragments)
}

struct PartialGroup {
    count: u16,
    received: u16,
    slices: Vec<Option<Vec<u8>>>,
    first_seen_ms: u64,
}

impl PartialGroup {
    fn byte_size(&self) -> usize {
        self.slices
            .iter()
            .flatten()
            .map(|slice| slice.len())
            .sum()
    }
}

/// Reassembles fragment envelopes back into their parent.
pub struct Reassembler {
    groups: HashMap<(NodeId, [u8; 8]), PartialGroup>,
    /// Incomplete groups older than this are evicted.
    timeout_ms: u64,
    /// Concurrent partial groups; the oldest is evicted when exceeded.
    max_groups: usize,
    /// Ceiling for the reassembled envelope's declared payload length.
    payload_ceiling: usize,
}

impl Reassembler {
    pub fn new(timeout_ms: u64, max_groups: usize, payload_ceiling: usize) -> Self {
        Self {
            groups: HashMap::new(),
            timeout_ms,
            max_groups: max_groups.max(1),
            payload_ceiling,
        }
    }

    /// Accept one fragment envelope. Returns the reassembled parent once all
    /// indices of the group have arrived; duplicates are dropped idempotently.
    pub fn accept(
        &mut self,
        envelope: &Envelope,
        now_ms: u64,
    ) -> Result<Option<Envelope>, ProtocolError> {
        let fragment = Fragment::from_payload(&envelope.payload)?;
        let key = (envelope.sender, fragment.group_id);

        if !self.groups.contains_key(&key) && self.groups.len() >= self.max_groups {
            self.evict_oldest();
        }

        let group = self.groups.entry(key).or_insert_with(|| PartialGroup {
            count: fragment.count,
            received: 0,
            slices: vec![None; fragment.count as usize],
            first_seen_ms: now_ms,
        });

        if group.count != fragment.count {
            // Conflicting count for the same group id: discard the buffer,
            // the stream is corrupt or forged.
            self.groups.remove(&key);
            return Err(ProtocolError::FragmentReassembly);
        }

        let slot = &mut group.slices[fragment.index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(fragment.slice);
        group.received += 1;

        if group.received < group.count {
            return Ok(None);
        }

        let group = self.groups.remove(&key).expect("group present");
        let mut bytes = Vec::with_capacity(group.byte_size());
        for slice in group.slices {
            bytes.extend_from_slice(&slice.expect("all slices received"));
        }
        let parent = Envelope::decode(&bytes, self.payload_ceiling)?;
        Ok(Some(parent))
    }

    /// Drop incomplete groups older than the timeout. Returns how many were
    /// evicted.
    pub fn evict_stale(&mut self, now_ms: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.groups.len();
        self.groups
            .retain(|_, group| now_ms.saturating_sub(group.first_seen_ms) < timeout);
        before - self.groups.len()
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.first_seen_ms)
            .map(|(key, _)| *key)
        {
            self.groups.remove(&key);
        }
    }
}
