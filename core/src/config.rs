//! Engine configuration — every tunable in one place
//!
//! Defaults follow the reference cadences: 15 s announce timeout, 60 s
//! inactivity and staleness windows, 30 s gossip sweep, 15 min block
//! cool-down. All durations are milliseconds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Human-readable name carried in our announcements.
    pub nickname: String,

    /// Initial TTL for locally originated broadcasts.
    pub max_ttl: u8,
    /// Largest envelope payload accepted on decode (DoS ceiling).
    pub payload_ceiling: usize,
    /// Envelopes whose encoding exceeds this are fragmented.
    pub max_frame_bytes: usize,
    /// Delay between consecutive fragment sends of one transfer.
    pub fragment_pacing_ms: u64,

    /// Dedup cache capacity (packet identities).
    pub dedup_capacity: usize,
    /// Identities older than this fall out of the dedup cache.
    pub dedup_window_ms: u64,

    /// Incomplete fragment groups are evicted after this long.
    pub reassembly_timeout_ms: u64,
    /// Concurrent partial fragment groups.
    pub reassembly_max_groups: usize,

    /// Topology entries unseen for this long are pruned.
    pub topology_stale_ms: u64,
    /// Cadence of the staleness sweep.
    pub topology_prune_interval_ms: u64,

    /// Our announcement cadence.
    pub announce_interval_ms: u64,
    /// A link that has not announced within this window is blocked.
    pub announce_timeout_ms: u64,
    /// A link silent for this long is blocked.
    pub inactivity_timeout_ms: u64,
    /// Error disconnects within `error_burst_window_ms` that trigger a block.
    pub error_burst_threshold: usize,
    pub error_burst_window_ms: u64,
    /// How long a blocked address stays blocked.
    pub block_duration_ms: u64,

    /// Retained-packet store: age, count, and byte budgets.
    pub store_retention_ms: u64,
    pub store_max_packets: usize,
    pub store_max_bytes: usize,

    /// Gossip sweep cadence and jitter.
    pub sync_interval_ms: u64,
    pub sync_jitter_ms: u64,
    /// One-shot sync delay after a neighbor's first confirmed announcement.
    pub new_neighbor_sync_delay_ms: u64,
    /// Golomb-Rice parameter P; false-positive rate is 2^-P.
    pub gcs_fpr_bits: u8,
    /// Byte budget for an encoded snapshot bitstream.
    pub gcs_max_bytes: usize,
    /// Hard cap on snapshot candidates regardless of the byte budget.
    pub gcs_max_elements: usize,
    /// Largest inbound snapshot bitstream we will decode (DoS ceiling).
    pub gcs_stream_ceiling: usize,

    /// Flood suppression: relay probability once confirmed-neighbor count
    /// reaches `flood_suppression_min_neighbors`. 1.0 disables suppression.
    pub flood_suppression_probability: f64,
    pub flood_suppression_min_neighbors: usize,

    /// Bound of the delivered-envelope channel to the consumer.
    pub delivery_queue_depth: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),

            max_ttl: 7,
            payload_ceiling: 10 * 1024 * 1024,
            max_frame_bytes: 512,
            fragment_pacing_ms: 200,

            dedup_capacity: 4096,
            dedup_window_ms: 5 * 60 * 1000,

            reassembly_timeout_ms: 30_000,
            reassembly_max_groups: 64,

            topology_stale_ms: 60_000,
            topology_prune_interval_ms: 15_000,

            announce_interval_ms: 10_000,
            announce_timeout_ms: 15_000,
            inactivity_timeout_ms: 60_000,
            error_burst_threshold: 5,
            error_burst_window_ms: 5 * 60 * 1000,
            block_duration_ms: 15 * 60 * 1000,

            store_retention_ms: 10 * 60 * 1000,
            store_max_packets: 512,
            store_max_bytes: 256 * 1024,

            sync_interval_ms: 30_000,
            sync_jitter_ms: 5_000,
            new_neighbor_sync_delay_ms: 5_000,
            gcs_fpr_bits: 8,
            gcs_max_bytes: 1024,
            gcs_max_elements: 512,
            gcs_stream_ceiling: 8192,

            flood_suppression_probability: 0.75,
            flood_suppression_min_neighbors: 4,

            delivery_queue_depth: 256,
        }
    }
}

impl MeshConfig {
    /// Largest candidate count the configured snapshot byte budget can hold:
    /// floor(8 * bytes / (P + 2)).
    pub fn gcs_capacity(&self) -> usize {
        let bits_per_element = self.gcs_fpr_bits as usize + 2;
        ((8 * self.gcs_max_bytes) / bits_per_element).min(self.gcs_max_elements)
    }
}
