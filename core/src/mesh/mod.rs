//! Mesh layer — topology maintenance and per-packet relay decisions
//!
//! - TopologyGraph: neighbor announcements with two-way edge confirmation;
//!   only mutually declared edges are eligible for routing
//! - PacketStore: recently seen broadcasts plus the latest announcement per
//!   sender, the candidate set gossip sync reconciles
//! - RelayEngine: dedup, deliver/forward/flood decision ladder

pub mod announce;
pub mod relay;
pub mod store;
pub mod topology;

pub use announce::Announcement;
pub use relay::{DropReason, RelayDecision, RelayEngine};
pub use store::{PacketStore, StoredPacket};
pub use topology::TopologyGraph;
