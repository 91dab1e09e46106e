//! In-memory mesh harness: engines wired link-to-link with no radio.
//!
//! Tests run with tokio's paused clock, so coordinator ticks and fragment
//! pacing advance instantly; mesh timestamps come from a shared manual
//! clock that tests advance explicitly via [`settle`].

#![allow(dead_code)]

use async_trait::async_trait;
use ember_core::engine::LinkTransport;
use ember_core::link::LinkError;
use ember_core::{
    Ed25519Signer, LinkId, ManualClock, MeshConfig, MeshEngine, MeshEvent, NodeId,
    ReceivedMessage,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct Wire {
    peer: MeshEngine,
    peer_link: LinkId,
}

/// Transport that delivers frames straight into the peer engine's inbound
/// queue.
#[derive(Default)]
pub struct TestTransport {
    wires: RwLock<HashMap<LinkId, Wire>>,
}

#[async_trait]
impl LinkTransport for TestTransport {
    async fn send_bytes(&self, link: LinkId, bytes: Vec<u8>) -> Result<(), LinkError> {
        let wire = self.wires.read().get(&link).cloned();
        match wire {
            Some(wire) => {
                let _ = wire.peer.inbound(wire.peer_link, bytes).await;
                Ok(())
            }
            None => Err(LinkError::LinkGone(link)),
        }
    }

    async fn close(&self, link: LinkId) {
        self.wires.write().remove(&link);
    }
}

pub struct Node {
    pub engine: MeshEngine,
    pub events: tokio::sync::mpsc::Receiver<MeshEvent>,
    pub transport: Arc<TestTransport>,
    pub id: NodeId,
}

/// Short cadences so scenarios converge in a few settle rounds.
pub fn test_config() -> MeshConfig {
    MeshConfig {
        announce_interval_ms: 1_000,
        sync_interval_ms: 60_000,
        sync_jitter_ms: 0,
        new_neighbor_sync_delay_ms: 500,
        fragment_pacing_ms: 20,
        // Deterministic relays: never suppress floods
        flood_suppression_probability: 1.0,
        ..Default::default()
    }
}

pub fn spawn_node(clock: &Arc<ManualClock>, seed: u8) -> Node {
    spawn_node_with(clock, seed, test_config())
}

pub fn spawn_node_with(clock: &Arc<ManualClock>, seed: u8, config: MeshConfig) -> Node {
    let transport = Arc::new(TestTransport::default());
    let signer = Arc::new(Ed25519Signer::from_seed([seed; 32]));
    let id = signer.node_id();
    let (engine, events) = MeshEngine::spawn(config, signer, clock.clone(), transport.clone());
    Node {
        engine,
        events,
        transport,
        id,
    }
}

/// Wire two nodes together and bring both link ends up. Link ids must be
/// unique within each node.
pub async fn connect(a: &Node, b: &Node, link_a: LinkId, link_b: LinkId) {
    a.transport.wires.write().insert(
        link_a,
        Wire {
            peer: b.engine.clone(),
            peer_link: link_b,
        },
    );
    b.transport.wires.write().insert(
        link_b,
        Wire {
            peer: a.engine.clone(),
            peer_link: link_a,
        },
    );
    a.engine
        .link_up(link_a, format!("addr-{link_a}"))
        .await
        .unwrap();
    b.engine
        .link_up(link_b, format!("addr-{link_b}"))
        .await
        .unwrap();
}

/// Advance the mesh clock and let coordinator ticks run.
pub async fn settle(clock: &ManualClock, ms: u64) {
    clock.advance(ms);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
}

/// Settle until both nodes report each other as confirmed neighbors.
pub async fn converge(clock: &ManualClock, a: &Node, b: &Node) {
    for _ in 0..20 {
        let a_sees = a.engine.neighbors().await.unwrap().contains(&b.id);
        let b_sees = b.engine.neighbors().await.unwrap().contains(&a.id);
        if a_sees && b_sees {
            return;
        }
        settle(clock, 1_000).await;
    }
    panic!(
        "nodes {} and {} never confirmed each other",
        hex::encode(a.id),
        hex::encode(b.id)
    );
}

/// Wait for the next delivered application message.
pub async fn next_message(node: &mut Node) -> ReceivedMessage {
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            match node.events.recv().await {
                Some(MeshEvent::Message(message)) => return message,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no message delivered in time")
}

/// Drain everything currently queued, returning only delivered messages.
pub fn drain_messages(node: &mut Node) -> Vec<ReceivedMessage> {
    let mut messages = Vec::new();
    while let Ok(event) = node.events.try_recv() {
        if let MeshEvent::Message(message) = event {
            messages.push(message);
        }
    }
    messages
}

/// Drop everything currently queued.
pub fn drain_all(node: &mut Node) {
    while node.events.try_recv().is_ok() {}
}

/// Deterministic incompressible payload so size thresholds behave.
pub fn noise_bytes(len: usize, seed: u64) -> Vec<u8> {
    (0..len as u64)
        .map(|i| {
            let mut x = i.wrapping_add(seed).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            x ^= x >> 29;
            (x.wrapping_mul(0xBF58_476D_1CE4_E5B9) >> 56) as u8
        })
        .collect()
}
