//! In-process demo mesh: N engines in a line, wired by a loopback
//! transport, exchanging broadcasts end to end.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use ember_core::engine::LinkTransport;
use ember_core::link::LinkError;
use ember_core::{
    Ed25519Signer, LinkId, MeshConfig, MeshEngine, MeshEvent, NodeId, SystemClock,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone)]
struct Wire {
    peer: MeshEngine,
    peer_link: LinkId,
}

#[derive(Default)]
struct LoopbackTransport {
    wires: RwLock<HashMap<LinkId, Wire>>,
}

#[async_trait]
impl LinkTransport for LoopbackTransport {
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

struct Node {
    name: String,
    engine: MeshEngine,
    events: mpsc::Receiver<MeshEvent>,
    transport: Arc<LoopbackTransport>,
    id: NodeId,
}

fn spawn_node(index: usize) -> Node {
    let name = format!("node-{index}");
    let config = MeshConfig {
        nickname: name.clone(),
        announce_interval_ms: 500,
        new_neighbor_sync_delay_ms: 500,
        ..Default::default()
    };
    let transport = Arc::new(LoopbackTransport::default());
    let signer = Arc::new(Ed25519Signer::generate());
    let id = signer.node_id();
    let (engine, events) = MeshEngine::spawn(
        config,
        signer,
        Arc::new(SystemClock),
        transport.clone(),
    );
    Node {
        name,
        engine,
        events,
        transport,
        id,
    }
}

async fn connect(a: &Node, b: &Node, link_a: LinkId, link_b: LinkId) -> Result<()> {
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
    a.engine.link_up(link_a, format!("demo-{link_a}")).await?;
    b.engine.link_up(link_b, format!("demo-{link_b}")).await?;
    Ok(())
}

pub async fn run(nodes: usize, messages: usize) -> Result<()> {
    ensure!(nodes >= 2, "a mesh needs at least two nodes");

    let mut mesh: Vec<Node> = (0..nodes).map(spawn_node).collect();
    for node in &mesh {
        info!(name = %node.name, id = %hex::encode(node.id), "spawned");
    }

    // Line topology: node i <-> node i+1
    for i in 0..nodes - 1 {
        let link_a = (i * 2 + 1) as LinkId;
        let link_b = (i * 2 + 2) as LinkId;
        connect(&mesh[i], &mesh[i + 1], link_a, link_b).await?;
    }

    // Let announcements confirm the line
    let last = mesh.len() - 1;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let ends_ready = !mesh[0].engine.neighbors().await?.is_empty()
            && !mesh[last].engine.neighbors().await?.is_empty();
        if ends_ready {
            break;
        }
    }

    for node in &mesh {
        let stats = node.engine.stats().await?;
        info!(
            name = %node.name,
            neighbors = stats.confirmed_neighbors,
            known = stats.known_nodes,
            "converged"
        );
    }

    for i in 0..messages {
        let body = format!("broadcast {} from {}", i + 1, mesh[0].name);
        mesh[0].engine.send_message(None, body.into_bytes()).await?;
    }

    // Collect deliveries at the far end of the line
    let mut received = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received < messages {
        let event = tokio::select! {
            event = mesh[last].events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match event {
            Some(MeshEvent::Message(message)) => {
                received += 1;
                println!(
                    "{} <- {}: {}",
                    mesh[last].name,
                    hex::encode(message.sender),
                    String::from_utf8_lossy(&message.payload),
                );
            }
            Some(_) => {}
            None => break,
        }
    }

    ensure!(
        received == messages,
        "only {received} of {messages} broadcasts crossed the mesh"
    );
    println!("delivered {received}/{messages} across {nodes} nodes");

    for node in &mesh {
        node.engine.leave().await.ok();
        node.engine.shutdown().await.ok();
    }
    Ok(())
}
