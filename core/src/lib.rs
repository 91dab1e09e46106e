//! Ember core — serverless mesh messaging engine
//!
//! A transport-agnostic core for peer-to-peer group messaging over
//! short-range radio links. The platform supplies the radio (a
//! [`LinkTransport`](engine::LinkTransport) implementation plus inbound
//! frame delivery); this crate supplies everything above it:
//!
//! - `protocol`: the binary envelope format, TLV payloads, LZ4 compression,
//!   content-derived packet identity, and fragmentation
//! - `mesh`: topology with two-way edge confirmation, the retained-packet
//!   store, and the deliver/forward/flood relay decision engine
//! - `sync`: Golomb-Coded-Set anti-entropy gossip for recovering missed
//!   broadcasts after partitions
//! - `link`: per-link health policy (announce/inactivity/error-burst
//!   blocking) and outbound transfer tracking
//! - `engine`: the single coordinator task tying it all together
//!
//! Nodes are identified by 8-byte ids derived from their Ed25519 signing
//! keys; announcements and locally originated traffic are signed, and an
//! announcement is only believed if its key hashes to the id it claims.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod link;
pub mod mesh;
pub mod protocol;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use crypto::{node_id_from_key, Ed25519Signer, Ed25519Verifier, Signer, Verifier};
pub use engine::{
    EngineError, EngineStats, LinkId, LinkTransport, MeshEngine, MeshEvent, ReceivedMessage,
};
pub use link::{BlockReason, TransferEvent, TransferId};
pub use protocol::{Envelope, MessageType, NodeId, PacketId};
