//! Anti-entropy gossip sync — GCS snapshots and reconciliation
//!
//! Periodically (and once shortly after a neighbor is first confirmed) a
//! node sends a Golomb-Coded Set describing the packet identities it already
//! holds. The receiver diffs the snapshot against its own retained packets
//! and re-sends whatever the requester is missing, TTL-forced to zero and
//! unicast to the requester only — sync traffic never propagates beyond the
//! immediate link.

pub mod gcs;
pub mod gossip;

pub use gcs::GcsSnapshot;
pub use gossip::{
    build_snapshot, decode_request, encode_request, missing_packets, SyncScheduler,
};

use thiserror::Error;

/// Sync validation errors. A malformed or oversized snapshot drops the
/// request; it never terminates the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Golomb-Rice parameter {0} out of bounds")]
    InvalidParameter(u8),

    #[error("Declared domain {m} inconsistent with parameter {p}")]
    InvalidDomain { m: u64, p: u8 },

    #[error("Snapshot bitstream of {declared} bytes exceeds ceiling {ceiling}")]
    StreamTooLong { declared: usize, ceiling: usize },

    #[error("Snapshot bitstream truncated")]
    Truncated,

    #[error("Snapshot elements not strictly increasing")]
    NotSorted,

    #[error("Missing snapshot field {0:#04x}")]
    MissingField(u8),

    #[error("Malformed request payload")]
    MalformedRequest,
}

/// Lowest accepted Golomb-Rice parameter.
pub const MIN_FPR_BITS: u8 = 1;
/// Highest accepted Golomb-Rice parameter (2^-16 false-positive rate).
pub const MAX_FPR_BITS: u8 = 16;
/// Hard ceiling on the element count a snapshot may declare.
pub const MAX_SNAPSHOT_ELEMENTS: u64 = 1 << 20;
