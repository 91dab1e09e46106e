//! Link layer — per-link health policy and outbound transfer tracking
//!
//! The physical radio is outside the core; this layer sees links only as
//! abstract handles with an address, and enforces the announce/inactivity/
//! error-burst policy that turns a misbehaving address into a blocked one.

pub mod monitor;
pub mod transfer;

pub use monitor::{BlockReason, ConnectionMonitor, LinkAddr, LinkState};
pub use transfer::{TransferEvent, TransferId, TransferTracker};

use thiserror::Error;

/// Transport-level failures surfaced by the physical send primitive.
/// They feed the connection monitor's error-burst accounting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link {0} is gone")]
    LinkGone(u64),

    #[error("Send failed on link {link}: {detail}")]
    SendFailed { link: u64, detail: String },

    #[error("Address {0} is blocked")]
    AddressBlocked(String),
}
