//! Gossip sync — snapshot wire format, diffing, and scheduling policy
//!
//! A `REQUEST_SYNC` envelope's payload is three TLVs:
//!
//! ```text
//! 0x01  P     u8       Golomb-Rice parameter
//! 0x02  M     u32 (BE) domain size, N·2^P
//! 0x03  data  bytes    GCS bitstream
//! ```
//!
//! The responder diffs the snapshot against its retained packets and
//! re-sends each missing one byte-identically with TTL forced to zero,
//! unicast to the requester.

use super::gcs::GcsSnapshot;
use super::SyncError;
use crate::mesh::store::{PacketStore, StoredPacket};
use crate::protocol::{reduce64, NodeId, TlvReader, TlvWriter};
use rand::Rng;
use std::collections::HashSet;

const TLV_PARAM: u8 = 0x01;
const TLV_DOMAIN: u8 = 0x02;
const TLV_DATA: u8 = 0x03;

/// Encode a snapshot into a REQUEST_SYNC payload.
pub fn encode_request(snapshot: &GcsSnapshot) -> Vec<u8> {
    debug_assert!(snapshot.m <= u32::MAX as u64);
    let mut writer = TlvWriter::new();
    writer.put(TLV_PARAM, &[snapshot.p]);
    writer.put(TLV_DOMAIN, &(snapshot.m as u32).to_be_bytes());
    writer.put(TLV_DATA, &snapshot.data);
    writer.into_bytes()
}

/// Decode and validate a REQUEST_SYNC payload.
pub fn decode_request(payload: &[u8], stream_ceiling: usize) -> Result<GcsSnapshot, SyncError> {
    let mut p = None;
    let mut m = None;
    let mut data = None;

    let mut reader = TlvReader::new(payload);
    loop {
        match reader.next_field() {
            Ok(Some(field)) => match field.tlv_type {
                TLV_PARAM if field.value.len() == 1 => p = Some(field.value[0]),
                TLV_DOMAIN if field.value.len() == 4 => {
                    m = Some(u32::from_be_bytes([
                        field.value[0],
                        field.value[1],
                        field.value[2],
                        field.value[3],
                    ]) as u64)
                }
                TLV_DATA => data = Some(field.value.to_vec()),
                // Unknown fields are skippable; malformed known ones are not.
                TLV_PARAM | TLV_DOMAIN => return Err(SyncError::MalformedRequest),
                _ => {}
            },
            Ok(None) => break,
            Err(_) => return Err(SyncError::MalformedRequest),
        }
    }

    let snapshot = GcsSnapshot {
        p: p.ok_or(SyncError::MissingField(TLV_PARAM))?,
        m: m.ok_or(SyncError::MissingField(TLV_DOMAIN))?,
        data: data.ok_or(SyncError::MissingField(TLV_DATA))?,
    };
    snapshot.validate(stream_ceiling)?;
    Ok(snapshot)
}

/// Build a snapshot of our retained packets: most recent broadcasts plus the
/// latest announcement per sender, capped by the configured candidate count.
pub fn build_snapshot(store: &PacketStore, now_ms: u64, cap: usize, p: u8) -> GcsSnapshot {
    let values: Vec<u64> = store
        .candidates(now_ms, cap)
        .iter()
        .map(|packet| reduce64(&packet.id))
        .collect();
    GcsSnapshot::build(&values, p)
}

/// Retained packets the snapshot's owner is missing, newest-first.
pub fn missing_packets<'a>(
    store: &'a PacketStore,
    snapshot: &GcsSnapshot,
    now_ms: u64,
    cap: usize,
) -> Result<Vec<&'a StoredPacket>, SyncError> {
    let members = snapshot.decode_members()?;
    Ok(store
        .candidates(now_ms, cap)
        .into_iter()
        .filter(|packet| {
            !GcsSnapshot::contains(&members, snapshot.m, reduce64(&packet.id))
        })
        .collect())
}

/// Which neighbors to sync with right now.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncDue {
    /// Periodic sweep: send REQUEST_SYNC to all confirmed neighbors.
    pub sweep: bool,
    /// One-shot targets whose post-confirmation delay has elapsed.
    pub one_shots: Vec<NodeId>,
}

/// Tracks when periodic sweeps and per-new-neighbor one-shots are due.
#[derive(Debug)]
pub struct SyncScheduler {
    interval_ms: u64,
    jitter_ms: u64,
    one_shot_delay_ms: u64,
    next_sweep_at_ms: u64,
    pending: Vec<(NodeId, u64)>,
    greeted: HashSet<NodeId>,
}

impl SyncScheduler {
    pub fn new(interval_ms: u64, jitter_ms: u64, one_shot_delay_ms: u64, now_ms: u64) -> Self {
        let mut scheduler = Self {
            interval_ms,
            jitter_ms,
            one_shot_delay_ms,
            next_sweep_at_ms: 0,
            pending: Vec::new(),
            greeted: HashSet::new(),
        };
        scheduler.schedule_next_sweep(now_ms);
        scheduler
    }

    /// A neighbor edge became confirmed for the first time; schedule the
    /// one-shot unicast sync.
    pub fn on_neighbor_confirmed(&mut self, node: NodeId, now_ms: u64) {
        if self.greeted.insert(node) {
            self.pending.push((node, now_ms + self.one_shot_delay_ms));
        }
    }

    /// Forget a departed neighbor so a future reappearance is greeted again.
    pub fn on_neighbor_lost(&mut self, node: &NodeId) {
        self.greeted.remove(node);
        self.pending.retain(|(pending, _)| pending != node);
    }

    /// Collect the work due at `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> SyncDue {
        let mut due = SyncDue::default();
        if now_ms >= self.next_sweep_at_ms {
            due.sweep = true;
            self.schedule_next_sweep(now_ms);
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(_, due_at)| now_ms >= *due_at);
        self.pending = waiting;
        due.one_shots = ready.into_iter().map(|(node, _)| node).collect();
        due
    }

    fn schedule_next_sweep(&mut self, now_ms: u64) {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        self.next_sweep_at_ms = now_ms + self.interval_ms + jitter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{packet_id, Envelope, MessageType};

    fn store_with(messages: &[(u8, u64)]) -> PacketStore {
        let mut store = PacketStore::new(600_000, 512, 0);
        for (sender, ts) in messages {
            let env = Envelope::broadcast(
                MessageType::Message,
                [*sender; 8],
                *ts,
                7,
                format!("m{sender}-{ts}").into_bytes(),
            );
            let bytes = env.encode().unwrap();
            store.insert(&env, bytes, 0);
        }
        store
    }

    #[test]
    fn test_request_payload_roundtrip() {
        let store = store_with(&[(1, 100), (2, 200), (3, 300)]);
        let snapshot = build_snapshot(&store, 0, 512, 8);

        let payload = encode_request(&snapshot);
        let restored = decode_request(&payload, 8192).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn test_request_missing_fields_rejected() {
        let mut writer = TlvWriter::new();
        writer.put(0x01, &[8]);
        let payload = writer.into_bytes();
        assert!(matches!(
            decode_request(&payload, 8192),
            Err(SyncError::MissingField(0x02))
        ));
    }

    #[test]
    fn test_request_unknown_tlv_skipped() {
        let store = store_with(&[(1, 100)]);
        let snapshot = build_snapshot(&store, 0, 512, 8);

        let mut writer = TlvWriter::new();
        writer.put(0x55, b"future");
        writer.put(0x01, &[snapshot.p]);
        writer.put(0x02, &(snapshot.m as u32).to_be_bytes());
        writer.put(0x03, &snapshot.data);

        let restored = decode_request(&writer.into_bytes(), 8192).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_request_oversize_stream_rejected() {
        let snapshot = GcsSnapshot {
            p: 8,
            m: 256 << 8,
            data: vec![0; 4096],
        };
        let payload = encode_request(&snapshot);
        assert!(matches!(
            decode_request(&payload, 100),
            Err(SyncError::StreamTooLong { .. })
        ));
    }

    #[test]
    fn test_diff_finds_missing_packets() {
        let store_a = store_with(&[(1, 100), (2, 200), (3, 300)]);
        let store_b = store_with(&[(1, 100), (2, 200)]);

        // B asks A: A should spot the (3, 300) message B lacks
        let snapshot_b = build_snapshot(&store_b, 0, 512, 8);
        let missing = missing_packets(&store_a, &snapshot_b, 0, 512).unwrap();

        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].sender, [3u8; 8]);
    }

    #[test]
    fn test_diff_identical_stores_empty() {
        let store_a = store_with(&[(1, 100), (2, 200)]);
        let store_b = store_with(&[(1, 100), (2, 200)]);

        let snapshot_b = build_snapshot(&store_b, 0, 512, 8);
        let missing = missing_packets(&store_a, &snapshot_b, 0, 512).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_diff_against_empty_snapshot_returns_all() {
        let store_a = store_with(&[(1, 100), (2, 200)]);
        let empty = GcsSnapshot::build(&[], 8);

        let missing = missing_packets(&store_a, &empty, 0, 512).unwrap();
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn test_missing_packet_bytes_are_originals() {
        let env = Envelope::broadcast(MessageType::Message, [5; 8], 500, 7, b"keep me".to_vec());
        let bytes = env.encode().unwrap();
        let mut store = PacketStore::new(600_000, 512, 0);
        store.insert(&env, bytes.clone(), 0);

        let empty = GcsSnapshot::build(&[], 8);
        let missing = missing_packets(&store, &empty, 0, 512).unwrap();
        assert_eq!(missing[0].bytes, bytes);
        assert_eq!(missing[0].id, packet_id(&env));
    }

    #[test]
    fn test_scheduler_periodic_sweep() {
        let mut scheduler = SyncScheduler::new(30_000, 0, 5_000, 0);
        assert_eq!(scheduler.poll(10_000), SyncDue::default());

        let due = scheduler.poll(30_000);
        assert!(due.sweep);

        // Next sweep rescheduled relative to the last fire
        assert!(!scheduler.poll(45_000).sweep);
        assert!(scheduler.poll(60_000).sweep);
    }

    #[test]
    fn test_scheduler_one_shot_after_delay() {
        let mut scheduler = SyncScheduler::new(30_000, 0, 5_000, 0);
        scheduler.on_neighbor_confirmed([1; 8], 1_000);

        assert!(scheduler.poll(3_000).one_shots.is_empty());
        assert_eq!(scheduler.poll(6_000).one_shots, vec![[1u8; 8]]);
        // Fires once
        assert!(scheduler.poll(7_000).one_shots.is_empty());
    }

    #[test]
    fn test_scheduler_greets_once_until_lost() {
        let mut scheduler = SyncScheduler::new(30_000, 0, 1_000, 0);
        scheduler.on_neighbor_confirmed([1; 8], 0);
        scheduler.on_neighbor_confirmed([1; 8], 100);
        assert_eq!(scheduler.poll(2_000).one_shots.len(), 1);

        // After the neighbor departs, a reappearance is greeted again
        scheduler.on_neighbor_lost(&[1; 8]);
        scheduler.on_neighbor_confirmed([1; 8], 3_000);
        assert_eq!(scheduler.poll(5_000).one_shots.len(), 1);
    }
}
