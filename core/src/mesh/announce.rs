//! Announcement payload — TLV body of an ANNOUNCE envelope
//!
//! ```text
//! 0x01  nickname      UTF-8, advisory only
//! 0x02  reserved      session handshake key, unused here
//! 0x03  signing key   32-byte Ed25519 public key
//! 0x04  neighbors     count * 8-byte node ids
//! ```
//!
//! An announcement is only trusted when the envelope is signed and the
//! carried signing key hashes to the sender id it claims; anyone can
//! announce, but nobody can announce *as* someone else.

use crate::crypto::node_id_from_key;
use crate::protocol::{NodeId, ProtocolError, TlvReader, TlvWriter};

pub const TLV_NICKNAME: u8 = 0x01;
// 0x02 carries the session handshake key in the full announce format;
// session crypto lives outside this crate, so the slot stays reserved.
pub const TLV_SIGNING_KEY: u8 = 0x03;
pub const TLV_NEIGHBORS: u8 = 0x04;

/// Longest accepted nickname in bytes.
pub const MAX_NICKNAME_LEN: usize = 64;

/// Decoded ANNOUNCE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub nickname: String,
    pub signing_key: [u8; 32],
    pub neighbors: Vec<NodeId>,
}

impl Announcement {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut writer = TlvWriter::new();
        writer.put(TLV_NICKNAME, self.nickname.as_bytes());
        writer.put(TLV_SIGNING_KEY, &self.signing_key);
        let mut flat = Vec::with_capacity(self.neighbors.len() * 8);
        for neighbor in &self.neighbors {
            flat.extend_from_slice(neighbor);
        }
        writer.put(TLV_NEIGHBORS, &flat);
        writer.into_bytes()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut nickname = String::new();
        let mut signing_key = None;
        let mut neighbors = Vec::new();

        let mut reader = TlvReader::new(payload);
        while let Some(field) = reader.next_field()? {
            match field.tlv_type {
                TLV_NICKNAME => {
                    let raw = &field.value[..field.value.len().min(MAX_NICKNAME_LEN)];
                    nickname = String::from_utf8_lossy(raw).into_owned();
                }
                TLV_SIGNING_KEY => {
                    if field.value.len() != 32 {
                        return Err(ProtocolError::MalformedTlv(0));
                    }
                    let mut key = [0u8; 32];
                    key.copy_from_slice(field.value);
                    signing_key = Some(key);
                }
                TLV_NEIGHBORS => {
                    if field.value.len() % 8 != 0 {
                        return Err(ProtocolError::MalformedTlv(0));
                    }
                    neighbors = field
                        .value
                        .chunks_exact(8)
                        .map(|chunk| {
                            let mut id = [0u8; 8];
                            id.copy_from_slice(chunk);
                            id
                        })
                        .collect();
                }
                _ => {}
            }
        }

        Ok(Self {
            nickname,
            signing_key: signing_key.ok_or(ProtocolError::MalformedTlv(0))?,
            neighbors,
        })
    }

    /// Whether the carried key actually speaks for `claimed` sender id.
    pub fn key_matches(&self, claimed: &NodeId) -> bool {
        node_id_from_key(&self.signing_key) == *claimed
    }
}
