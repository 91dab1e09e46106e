//! Ember wire protocol — compact binary envelope format for mesh relay
//!
//! This module provides:
//! - Envelope: the atomic message unit (fixed header + optional route + TLV payload)
//! - TLV: type-length-value sub-encoding for extensible payload fields
//! - LZ4 compression: optional payload compression behind the COMPRESSED flag
//! - PacketId: content-derived identity used for duplicate suppression and sync
//! - Fragmentation: splitting/reassembly of envelopes exceeding the link MTU
//!
//! Wire layout progression:
//! 1. Envelope: versioned fixed header, sender/recipient ids, optional source route
//! 2. TLV payload: skippable sub-fields, forward compatible
//! 3. Optional LZ4 compression of the payload bytes
//! 4. Fragments: route-preserving slices of an oversized encoded envelope

pub mod compress;
pub mod envelope;
pub mod fragment;
pub mod identity;
pub mod tlv;

pub use envelope::{Envelope, EnvelopeFlags, MessageType};
pub use fragment::{fragment_envelope, Fragment, Reassembler};
pub use identity::{packet_id, reduce64, signing_bytes, PacketId};
pub use tlv::{TlvReader, TlvWriter};

use thiserror::Error;

/// Protocol version 1: 2-byte payload length, no source routes.
pub const VERSION_1: u8 = 1;
/// Protocol version 2: 4-byte payload length, optional source routes.
pub const VERSION_2: u8 = 2;

/// 8-byte node identifier, derived from the node's signing key.
pub type NodeId = [u8; 8];

/// Maximum number of intermediate hops in a source route.
pub const MAX_ROUTE_HOPS: usize = 10;

/// Fixed header size for version 1 envelopes.
pub const HEADER_LEN_V1: usize = 14;
/// Fixed header size for version 2 envelopes.
pub const HEADER_LEN_V2: usize = 16;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Wire protocol errors. All decode failures are local and non-fatal:
/// the offending packet is dropped, the pipeline keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Unsupported protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    #[error("Declared length {declared} exceeds ceiling {ceiling}")]
    OversizeClaim { declared: usize, ceiling: usize },

    #[error("Payload too large for version {version}: {len} bytes")]
    PayloadTooLarge { version: u8, len: usize },

    #[error("Route has {0} hops (max {MAX_ROUTE_HOPS})")]
    RouteTooLong(usize),

    #[error("Malformed TLV at offset {0}")]
    MalformedTlv(usize),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Fragment index {index} out of range (count {count})")]
    FragmentIndexOutOfRange { index: u16, count: u16 },

    #[error("Fragment group reassembled to inconsistent envelope")]
    FragmentReassembly,
}
