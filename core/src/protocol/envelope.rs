//! Envelope — the protocol's atomic message unit
//!
//! Layout (big-endian, no padding):
//!
//! ```text
//! [1]  version (1 or 2)
//! [1]  message type
//! [1]  ttl
//! [1]  flags (HAS_RECIPIENT | HAS_ROUTE | COMPRESSED | SIGNED)
//! [8]  timestamp, milliseconds since epoch (BE u64)
//! [2]  payload length (BE u16)            — version 1, max 64 KiB
//! [4]  payload length (BE u32)            — version 2
//! [8]  sender id
//! [8]  recipient id                       — iff HAS_RECIPIENT
//! [1+n*8] route: count + hop ids          — iff HAS_ROUTE, version 2 only
//! [N]  payload (TLV sequence, optionally LZ4-compressed)
//! [64] signature                          — iff SIGNED
//! ```
//!
//! A version-1 receiver must ignore HAS_ROUTE: the flag is only meaningful
//! from version 2 on, and version-1 frames never carry a route block.

use super::{
    compress, NodeId, ProtocolError, HEADER_LEN_V1, HEADER_LEN_V2, MAX_ROUTE_HOPS, SIGNATURE_LEN,
    VERSION_1, VERSION_2,
};

/// Message type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Neighbor/identity announcement (0x01)
    Announce = 0x01,
    /// Graceful departure (0x03)
    Leave = 0x03,
    /// Chat message (0x04)
    Message = 0x04,
    /// Fragment of an oversized envelope (0x06)
    Fragment = 0x06,
    /// Anti-entropy sync request carrying a GCS snapshot (0x21)
    RequestSync = 0x21,
    /// File transfer payload (0x22)
    FileTransfer = 0x22,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x03 => Ok(MessageType::Leave),
            0x04 => Ok(MessageType::Message),
            0x06 => Ok(MessageType::Fragment),
            0x21 => Ok(MessageType::RequestSync),
            0x22 => Ok(MessageType::FileTransfer),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Envelope header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeFlags(pub u8);

impl EnvelopeFlags {
    pub const HAS_RECIPIENT: u8 = 0x01;
    pub const HAS_ROUTE: u8 = 0x02;
    pub const COMPRESSED: u8 = 0x04;
    pub const SIGNED: u8 = 0x08;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// The protocol's atomic message unit.
///
/// Flag bits are derived from the optional fields at encode time rather than
/// stored, so an `Envelope` can never be internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Protocol version (1 or 2)
    pub version: u8,
    /// Message type
    pub msg_type: MessageType,
    /// Remaining hops; the only field a relay mutates
    pub ttl: u8,
    /// Creation time, milliseconds since Unix epoch
    pub timestamp_ms: u64,
    /// Originating node
    pub sender: NodeId,
    /// Addressed recipient; `None` means broadcast
    pub recipient: Option<NodeId>,
    /// Source route of intermediate hops (version 2 only, max 10)
    pub route: Vec<NodeId>,
    /// TLV payload bytes, LZ4-compressed iff `compressed`
    pub payload: Vec<u8>,
    /// Payload is LZ4-compressed
    pub compressed: bool,
    /// Ed25519 signature over the TTL-normalized encoding
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Envelope {
    /// Maximum payload for a version-1 envelope (u16 length field).
    pub const MAX_PAYLOAD_V1: usize = u16::MAX as usize;

    /// New broadcast envelope (no recipient, no route).
    pub fn broadcast(
        msg_type: MessageType,
        sender: NodeId,
        timestamp_ms: u64,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: VERSION_1,
            msg_type,
            ttl,
            timestamp_ms,
            sender,
            recipient: None,
            route: Vec::new(),
            payload,
            compressed: false,
            signature: None,
        }
    }

    /// New directly-addressed envelope.
    pub fn direct(
        msg_type: MessageType,
        sender: NodeId,
        recipient: NodeId,
        timestamp_ms: u64,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient: Some(recipient),
            ..Self::broadcast(msg_type, sender, timestamp_ms, ttl, payload)
        }
    }

    /// Attach a source route; upgrades the envelope to version 2.
    pub fn with_route(mut self, route: Vec<NodeId>) -> Self {
        self.version = VERSION_2;
        self.route = route;
        self
    }

    /// Copy with a different TTL, everything else untouched. Relays use this
    /// for the decrement; identity and signature are unaffected since both
    /// exclude TTL.
    pub fn with_ttl(&self, ttl: u8) -> Self {
        let mut env = self.clone();
        env.ttl = ttl;
        env
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Whether this envelope belongs in the retained-packet set that gossip
    /// sync reconciles: broadcast chat/file traffic plus announcements.
    pub fn is_gossip_tracked(&self) -> bool {
        match self.msg_type {
            MessageType::Announce => true,
            MessageType::Message | MessageType::FileTransfer => self.is_broadcast(),
            _ => false,
        }
    }

    fn flag_bits(&self) -> u8 {
        let mut flags = 0u8;
        if self.recipient.is_some() {
            flags |= EnvelopeFlags::HAS_RECIPIENT;
        }
        if !self.route.is_empty() && self.version >= VERSION_2 {
            flags |= EnvelopeFlags::HAS_ROUTE;
        }
        if self.compressed {
            flags |= EnvelopeFlags::COMPRESSED;
        }
        if self.signature.is_some() {
            flags |= EnvelopeFlags::SIGNED;
        }
        flags
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.version != VERSION_1 && self.version != VERSION_2 {
            return Err(ProtocolError::InvalidVersion(self.version));
        }
        if self.route.len() > MAX_ROUTE_HOPS {
            return Err(ProtocolError::RouteTooLong(self.route.len()));
        }
        // Routes require the 4-byte length header; constructing a v1 envelope
        // with a route is a caller bug.
        debug_assert!(self.route.is_empty() || self.version >= VERSION_2);

        if self.version == VERSION_1 && self.payload.len() > Self::MAX_PAYLOAD_V1 {
            return Err(ProtocolError::PayloadTooLarge {
                version: self.version,
                len: self.payload.len(),
            });
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge {
                version: self.version,
                len: self.payload.len(),
            });
        }

        let header_len = if self.version == VERSION_1 {
            HEADER_LEN_V1
        } else {
            HEADER_LEN_V2
        };
        let mut buf = Vec::with_capacity(
            header_len + 16 + 1 + self.route.len() * 8 + self.payload.len() + SIGNATURE_LEN,
        );

        buf.push(self.version);
        buf.push(self.msg_type.as_u8());
        buf.push(self.ttl);
        buf.push(self.flag_bits());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        if self.version == VERSION_1 {
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        }

        buf.extend_from_slice(&self.sender);
        if let Some(recipient) = &self.recipient {
            buf.extend_from_slice(recipient);
        }
        if !self.route.is_empty() && self.version >= VERSION_2 {
            buf.push(self.route.len() as u8);
            for hop in &self.route {
                buf.extend_from_slice(hop);
            }
        }
        buf.extend_from_slice(&self.payload);
        if let Some(signature) = &self.signature {
            buf.extend_from_slice(signature);
        }

        Ok(buf)
    }

    /// Deserialize from wire bytes.
    ///
    /// `payload_ceiling` rejects oversize length claims before any allocation
    /// happens; pass the configured maximum accepted payload.
    pub fn decode(data: &[u8], payload_ceiling: usize) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::BufferTooShort { need: 1, got: 0 });
        }
        let version = data[0];
        let header_len = match version {
            VERSION_1 => HEADER_LEN_V1,
            VERSION_2 => HEADER_LEN_V2,
            other => return Err(ProtocolError::InvalidVersion(other)),
        };
        if data.len() < header_len {
            return Err(ProtocolError::BufferTooShort {
                need: header_len,
                got: data.len(),
            });
        }

        let msg_type = MessageType::from_u8(data[1])?;
        let ttl = data[2];
        let flags = EnvelopeFlags(data[3]);
        let timestamp_ms = u64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let payload_len = if version == VERSION_1 {
            u16::from_be_bytes([data[12], data[13]]) as usize
        } else {
            u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize
        };
        if payload_len > payload_ceiling {
            return Err(ProtocolError::OversizeClaim {
                declared: payload_len,
                ceiling: payload_ceiling,
            });
        }

        let mut offset = header_len;
        let take = |offset: &mut usize, n: usize| -> Result<&[u8], ProtocolError> {
            let slice = data
                .get(*offset..*offset + n)
                .ok_or(ProtocolError::BufferTooShort {
                    need: *offset + n,
                    got: data.len(),
                })?;
            *offset += n;
            Ok(slice)
        };

        let mut sender = [0u8; 8];
        sender.copy_from_slice(take(&mut offset, 8)?);

        let recipient = if flags.contains(EnvelopeFlags::HAS_RECIPIENT) {
            let mut id = [0u8; 8];
            id.copy_from_slice(take(&mut offset, 8)?);
            Some(id)
        } else {
            None
        };

        // HAS_ROUTE is only meaningful from version 2 on.
        let route = if version >= VERSION_2 && flags.contains(EnvelopeFlags::HAS_ROUTE) {
            let count = take(&mut offset, 1)?[0] as usize;
            if count > MAX_ROUTE_HOPS {
                return Err(ProtocolError::RouteTooLong(count));
            }
            let mut route = Vec::with_capacity(count);
            for _ in 0..count {
                let mut hop = [0u8; 8];
                hop.copy_from_slice(take(&mut offset, 8)?);
                route.push(hop);
            }
            route
        } else {
            Vec::new()
        };

        let payload = take(&mut offset, payload_len)?.to_vec();

        let signature = if flags.contains(EnvelopeFlags::SIGNED) {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(take(&mut offset, SIGNATURE_LEN)?);
            Some(sig)
        } else {
            None
        };

        Ok(Envelope {
            version,
            msg_type,
            ttl,
            timestamp_ms,
            sender,
            recipient,
            route,
            payload,
            compressed: flags.contains(EnvelopeFlags::COMPRESSED),
            signature,
        })
    }

    /// Payload with the COMPRESSED flag resolved: decompresses when set,
    /// borrows otherwise. `ceiling` bounds the decompressed size.
    pub fn decoded_payload(&self, ceiling: usize) -> Result<Vec<u8>, ProtocolError> {
        if self.compressed {
            compress::decompress(&self.payload, ceiling)
        } else {
            Ok(self.payload.clone())
        }
    }
}
