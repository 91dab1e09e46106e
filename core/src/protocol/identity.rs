//! Packet identity — content-derived digests for dedup, sync, and signing
//!
//! A packet's identity is a 16-byte blake3 truncation over
//! `{type, sender, timestamp, payload}`. TTL is deliberately excluded: a
//! relay only mutates TTL, so forwarding never changes identity. The same
//! exclusion applies to the signing input, which normalizes TTL to zero, so
//! a signature stays valid across hops.

use super::envelope::Envelope;
use super::ProtocolError;

/// 16-byte packet identity digest.
pub type PacketId = [u8; 16];

/// Compute the identity digest of an envelope.
pub fn packet_id(envelope: &Envelope) -> PacketId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[envelope.msg_type.as_u8()]);
    hasher.update(&envelope.sender);
    hasher.update(&envelope.timestamp_ms.to_be_bytes());
    hasher.update(&envelope.payload);
    let digest = hasher.finalize();

    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    id
}

/// Second-stage reduction to 64 bits for GCS membership testing.
pub fn reduce64(id: &PacketId) -> u64 {
    let digest = blake3::hash(id);
    let bytes = digest.as_bytes();
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Canonical byte sequence an envelope signature covers: the full encoding
/// with TTL normalized to zero and the signature itself absent.
pub fn signing_bytes(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let mut normalized = envelope.with_ttl(0);
    normalized.signature = None;
    normalized.encode()
}
