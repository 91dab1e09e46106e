//! Mesh engine — single-owner coordinator over all mesh state
//!
//! One tokio task owns the topology graph, dedup cache, reassembler, packet
//! store, connection monitor, and sync scheduler. Everything reaches it
//! through an mpsc command channel, so no lock ever guards mesh state; the
//! [`MeshEngine`] handle is a thin, cloneable front for that channel.
//!
//! The physical radio stays outside the core. A platform driver implements
//! [`LinkTransport`] for outbound frames and feeds inbound frames and link
//! lifecycle through the handle. Delivered messages, neighbor changes, and
//! transfer progress come back on a bounded event channel.

use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::crypto::{node_id_from_key, Ed25519Verifier, Signer, Verifier};
use crate::link::{
    BlockReason, ConnectionMonitor, LinkAddr, LinkError, TransferEvent, TransferId,
    TransferTracker,
};
use crate::mesh::announce::Announcement;
use crate::mesh::{DropReason, PacketStore, RelayDecision, RelayEngine, TopologyGraph};
use crate::protocol::{
    fragment_envelope, signing_bytes, Envelope, MessageType, NodeId, ProtocolError, Reassembler,
    TlvWriter, HEADER_LEN_V2,
};
use crate::sync::{
    build_snapshot, decode_request, encode_request, missing_packets, SyncScheduler,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Opaque handle for one physical link, assigned by the platform driver.
pub type LinkId = u64;

/// File payload TLVs.
pub const TLV_FILE_NAME: u8 = 0x01;
pub const TLV_FILE_CONTENT: u8 = 0x03;

/// Coordinator timer granularity.
const TICK_MS: u64 = 500;

/// Command channel depth; senders briefly await when the coordinator lags.
const COMMAND_QUEUE_DEPTH: usize = 512;

/// Outbound frame sink implemented by the platform radio driver.
#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    async fn send_bytes(&self, link: LinkId, bytes: Vec<u8>) -> Result<(), LinkError>;
    async fn close(&self, link: LinkId);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is shut down")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A locally delivered application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender: NodeId,
    pub msg_type: MessageType,
    /// Payload with compression already resolved.
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
    /// Signature checked against the sender's announced key.
    pub verified: bool,
}

/// Events the engine emits to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Message(ReceivedMessage),
    /// Two-way edge with a direct peer became confirmed.
    NeighborConfirmed(NodeId),
    NeighborLost(NodeId),
    Transfer(TransferEvent),
}

/// Point-in-time engine diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub known_nodes: usize,
    pub confirmed_neighbors: usize,
    pub links: usize,
    pub blocked_addresses: usize,
    pub stored_packets: usize,
    pub stored_bytes: usize,
    pub dedup_entries: usize,
    pub pending_fragment_groups: usize,
    pub active_transfers: usize,
}

enum EngineCommand {
    LinkUp {
        link: LinkId,
        address: LinkAddr,
    },
    LinkClosed {
        link: LinkId,
        error: bool,
    },
    Inbound {
        link: LinkId,
        bytes: Vec<u8>,
    },
    SendMessage {
        recipient: Option<NodeId>,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<Option<TransferId>, EngineError>>,
    },
    SendFile {
        recipient: Option<NodeId>,
        name: String,
        content: Vec<u8>,
        reply: oneshot::Sender<Result<Option<TransferId>, EngineError>>,
    },
    CancelTransfer {
        id: TransferId,
    },
    FragmentReady {
        id: TransferId,
        frame: Vec<u8>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    RouteTo {
        node: NodeId,
        reply: oneshot::Sender<Option<Vec<NodeId>>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Leave,
    Shutdown,
}

/// Cloneable handle to the engine's coordinator task.
#[derive(Clone)]
pub struct MeshEngine {
    commands: mpsc::Sender<EngineCommand>,
    local_id: NodeId,
}

impl MeshEngine {
    /// Spawn the coordinator task. Returns the handle plus the event stream.
    pub fn spawn(
        config: MeshConfig,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn LinkTransport>,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(config.delivery_queue_depth);

        let local_id = node_id_from_key(&signer.public_key());
        let now = clock.now_ms();
        let state = EngineState {
            local_id,
            relay: RelayEngine::new(
                local_id,
                config.dedup_capacity,
                config.dedup_window_ms,
                config.flood_suppression_probability,
                config.flood_suppression_min_neighbors,
            ),
            topology: TopologyGraph::new(),
            reassembler: Reassembler::new(
                config.reassembly_timeout_ms,
                config.reassembly_max_groups,
                config.payload_ceiling,
            ),
            store: PacketStore::new(
                config.store_retention_ms,
                config.store_max_packets,
                config.store_max_bytes,
            ),
            monitor: ConnectionMonitor::new(
                config.announce_timeout_ms,
                config.inactivity_timeout_ms,
                config.error_burst_threshold,
                config.error_burst_window_ms,
                config.block_duration_ms,
            ),
            scheduler: SyncScheduler::new(
                config.sync_interval_ms,
                config.sync_jitter_ms,
                config.new_neighbor_sync_delay_ms,
                now,
            ),
            transfers: TransferTracker::new(),
            links: HashMap::new(),
            peers: HashMap::new(),
            known_keys: HashMap::new(),
            confirmed: HashSet::new(),
            transfer_targets: HashMap::new(),
            transfer_cancels: HashMap::new(),
            last_announce_ms: 0,
            last_prune_ms: now,
            config,
            signer,
            verifier: Ed25519Verifier,
            clock,
            transport,
            events: event_tx,
            commands: command_tx.clone(),
        };

        tokio::spawn(state.run(command_rx));

        (
            Self {
                commands: command_tx,
                local_id,
            },
            event_rx,
        )
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Report a newly established link. The engine refuses (and closes) links
    /// to blocked addresses.
    pub async fn link_up(&self, link: LinkId, address: LinkAddr) -> Result<(), EngineError> {
        self.send(EngineCommand::LinkUp { link, address }).await
    }

    /// Report a closed link; `error` marks abnormal teardown.
    pub async fn link_closed(&self, link: LinkId, error: bool) -> Result<(), EngineError> {
        self.send(EngineCommand::LinkClosed { link, error }).await
    }

    /// Feed one inbound frame from a link.
    pub async fn inbound(&self, link: LinkId, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.send(EngineCommand::Inbound { link, bytes }).await
    }

    /// Send a chat message; `None` recipient broadcasts. Returns a transfer
    /// id when the envelope had to be fragmented.
    pub async fn send_message(
        &self,
        recipient: Option<NodeId>,
        body: Vec<u8>,
    ) -> Result<Option<TransferId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::SendMessage {
            recipient,
            body,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Send a named file.
    pub async fn send_file(
        &self,
        recipient: Option<NodeId>,
        name: String,
        content: Vec<u8>,
    ) -> Result<Option<TransferId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::SendFile {
            recipient,
            name,
            content,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Cancel an in-flight fragmented transfer.
    pub async fn cancel_transfer(&self, id: TransferId) -> Result<(), EngineError> {
        self.send(EngineCommand::CancelTransfer { id }).await
    }

    /// Confirmed direct neighbors.
    pub async fn neighbors(&self) -> Result<Vec<NodeId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Neighbors { reply }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Shortest confirmed-edge path to a node, endpoints included.
    pub async fn route_to(&self, node: NodeId) -> Result<Option<Vec<NodeId>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::RouteTo { node, reply }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Stats { reply }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Broadcast a graceful departure to the mesh.
    pub async fn leave(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Leave).await
    }

    /// Stop the coordinator task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Shutdown).await
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

#[derive(Debug, Clone)]
struct LinkInfo {
    address: LinkAddr,
    peer: Option<NodeId>,
}

/// Where a transfer's fragments go.
#[derive(Debug, Clone, Copy)]
enum SendTargets {
    Broadcast,
    Peer(NodeId),
}

struct EngineState {
    local_id: NodeId,
    relay: RelayEngine,
    topology: TopologyGraph,
    reassembler: Reassembler,
    store: PacketStore,
    monitor: ConnectionMonitor,
    scheduler: SyncScheduler,
    transfers: TransferTracker,

    links: HashMap<LinkId, LinkInfo>,
    /// Direct peers with an announced link, node id to link.
    peers: HashMap<NodeId, LinkId>,
    /// Signing keys learned from verified announcements.
    known_keys: HashMap<NodeId, [u8; 32]>,
    /// Direct peers whose edge with us is currently confirmed.
    confirmed: HashSet<NodeId>,

    transfer_targets: HashMap<TransferId, SendTargets>,
    transfer_cancels: HashMap<TransferId, Arc<AtomicBool>>,

    last_announce_ms: u64,
    last_prune_ms: u64,

    config: MeshConfig,
    signer: Arc<dyn Signer>,
    verifier: Ed25519Verifier,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn LinkTransport>,
    events: mpsc::Sender<MeshEvent>,
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineState {
    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        info!(id = %hex::encode(self.local_id), "mesh engine started");
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
        info!(id = %hex::encode(self.local_id), "mesh engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::LinkUp { link, address } => self.on_link_up(link, address).await,
            EngineCommand::LinkClosed { link, error } => self.on_link_closed(link, error),
            EngineCommand::Inbound { link, bytes } => self.on_inbound(link, bytes).await,
            EngineCommand::SendMessage {
                recipient,
                body,
                reply,
            } => {
                let result = self
                    .send_local(MessageType::Message, recipient, body, true)
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::SendFile {
                recipient,
                name,
                content,
                reply,
            } => {
                let mut writer = TlvWriter::new();
                writer.put(TLV_FILE_NAME, name.as_bytes());
                writer.put_wide(TLV_FILE_CONTENT, &content);
                let result = self
                    .send_local(MessageType::FileTransfer, recipient, writer.into_bytes(), false)
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::CancelTransfer { id } => self.on_cancel_transfer(id),
            EngineCommand::FragmentReady { id, frame } => self.on_fragment_ready(id, frame).await,
            EngineCommand::Neighbors { reply } => {
                let _ = reply.send(self.confirmed.iter().copied().collect());
            }
            EngineCommand::RouteTo { node, reply } => {
                let _ = reply.send(self.topology.shortest_path(&self.local_id, &node));
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            EngineCommand::Leave => self.broadcast_leave().await,
            EngineCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    // ---- link lifecycle ----

    async fn on_link_up(&mut self, link: LinkId, address: LinkAddr) {
        let now = self.clock.now_ms();
        if !self.monitor.link_established(&address, now) {
            warn!(link, %address, "refusing link to blocked address");
            self.transport.close(link).await;
            return;
        }
        debug!(link, %address, "link up");
        self.links.insert(
            link,
            LinkInfo {
                address,
                peer: None,
            },
        );
        // Announce right away so the new peer learns us without waiting for
        // the next cadence.
        self.broadcast_announce(now).await;
    }

    fn on_link_closed(&mut self, link: LinkId, error: bool) {
        let now = self.clock.now_ms();
        let Some(info) = self.links.remove(&link) else {
            return;
        };
        debug!(link, address = %info.address, error, "link closed");
        self.monitor.link_closed(&info.address, error, now);
        if let Some(peer) = info.peer {
            self.drop_peer(peer, link);
        }
    }

    fn drop_peer(&mut self, peer: NodeId, link: LinkId) {
        if self.peers.get(&peer) == Some(&link) {
            self.peers.remove(&peer);
            self.scheduler.on_neighbor_lost(&peer);
            if self.confirmed.remove(&peer) {
                self.emit(MeshEvent::NeighborLost(peer));
            }
        }
    }

    // ---- inbound pipeline ----

    async fn on_inbound(&mut self, link: LinkId, bytes: Vec<u8>) {
        let now = self.clock.now_ms();
        let Some(info) = self.links.get(&link) else {
            debug!(link, "frame on unknown link");
            return;
        };
        let address = info.address.clone();
        self.monitor.on_activity(&address, now);

        let envelope = match Envelope::decode(&bytes, self.config.payload_ceiling) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(link, %err, "dropping undecodable frame");
                return;
            }
        };

        if envelope.sender == self.local_id {
            // Our own traffic echoed back through the mesh.
            return;
        }

        match envelope.msg_type {
            MessageType::Announce => self.on_announce(link, envelope, bytes, now).await,
            MessageType::Leave => self.on_leave(link, envelope, bytes, now).await,
            MessageType::RequestSync => self.on_sync_request(link, envelope, now).await,
            MessageType::Fragment => self.on_fragment(link, envelope, bytes, now).await,
            MessageType::Message | MessageType::FileTransfer => {
                self.on_traffic(link, envelope, bytes, now).await
            }
        }
    }

    async fn on_announce(&mut self, link: LinkId, envelope: Envelope, bytes: Vec<u8>, now: u64) {
        let payload = match envelope.decoded_payload(self.config.payload_ceiling) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%err, "announce payload undecodable");
                return;
            }
        };
        let announcement = match Announcement::from_payload(&payload) {
            Ok(announcement) => announcement,
            Err(err) => {
                debug!(%err, "malformed announcement");
                return;
            }
        };
        if !self.verify_announce(&envelope, &announcement) {
            warn!(sender = %hex::encode(envelope.sender), "rejecting unverified announcement");
            return;
        }

        let decision = self.relay.decide(&envelope, &self.live_neighbors(), now);
        if matches!(decision, RelayDecision::Drop(DropReason::Duplicate)) {
            return;
        }

        self.known_keys
            .insert(envelope.sender, announcement.signing_key);
        self.topology.apply_announcement(
            envelope.sender,
            &announcement.neighbors,
            envelope.timestamp_ms,
            now,
        );
        self.store.insert(&envelope, bytes.clone(), now);

        // An undecremented TTL means the announcement came from the link's
        // own peer, not a relay; that is what binds the link to a node id.
        if let Some(info) = self.links.get_mut(&link) {
            if info.peer.is_none() && envelope.ttl == self.config.max_ttl {
                info.peer = Some(envelope.sender);
                self.peers.insert(envelope.sender, link);
            }
            if info.peer == Some(envelope.sender) {
                let address = info.address.clone();
                self.monitor.on_announce(&address, now);
            }
        }
        self.refresh_confirmations(now);

        if matches!(decision, RelayDecision::Flood { .. }) && envelope.ttl > 0 {
            self.relay_bytes(&bytes, envelope.ttl, Some(link)).await;
        }
    }

    fn verify_announce(&self, envelope: &Envelope, announcement: &Announcement) -> bool {
        if !announcement.key_matches(&envelope.sender) {
            return false;
        }
        let Some(signature) = &envelope.signature else {
            return false;
        };
        let Ok(message) = signing_bytes(envelope) else {
            return false;
        };
        self.verifier
            .verify(&message, signature, &announcement.signing_key)
    }

    async fn on_leave(&mut self, link: LinkId, envelope: Envelope, bytes: Vec<u8>, now: u64) {
        let decision = self.relay.decide(&envelope, &self.live_neighbors(), now);
        if matches!(decision, RelayDecision::Drop(DropReason::Duplicate)) {
            return;
        }
        info!(node = %hex::encode(envelope.sender), "node left the mesh");
        self.topology.remove_node(&envelope.sender);
        if let Some(peer_link) = self.peers.get(&envelope.sender).copied() {
            self.drop_peer(envelope.sender, peer_link);
            if let Some(info) = self.links.get_mut(&peer_link) {
                info.peer = None;
            }
        }
        if matches!(decision, RelayDecision::Flood { .. }) && envelope.ttl > 0 {
            self.relay_bytes(&bytes, envelope.ttl, Some(link)).await;
        }
    }

    /// Sync requests are answered on the arrival link and never relayed.
    async fn on_sync_request(&mut self, link: LinkId, envelope: Envelope, now: u64) {
        if envelope.recipient.is_some() && envelope.recipient != Some(self.local_id) {
            return;
        }
        let payload = match envelope.decoded_payload(self.config.payload_ceiling) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%err, "sync request payload undecodable");
                return;
            }
        };
        let snapshot = match decode_request(&payload, self.config.gcs_stream_ceiling) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, sender = %hex::encode(envelope.sender), "rejecting sync request");
                return;
            }
        };
        let resends: Vec<Vec<u8>> =
            match missing_packets(&self.store, &snapshot, now, self.config.gcs_capacity()) {
                Ok(missing) => missing.iter().map(|packet| packet.bytes.clone()).collect(),
                Err(err) => {
                    warn!(%err, "undecodable sync snapshot");
                    return;
                }
            };
        debug!(
            peer = %hex::encode(envelope.sender),
            count = resends.len(),
            "answering sync request"
        );
        for mut frame in resends {
            // TTL forced to zero: the re-send is for the requester alone.
            frame[2] = 0;
            if let Err(err) = self.transport.send_bytes(link, frame).await {
                debug!(link, %err, "sync re-send failed");
                break;
            }
        }
    }

    async fn on_fragment(&mut self, link: LinkId, envelope: Envelope, bytes: Vec<u8>, now: u64) {
        let decision = self.relay.decide(&envelope, &self.live_neighbors(), now);
        match decision {
            RelayDecision::Deliver => self.accept_fragment(&envelope, now).await,
            RelayDecision::Flood { deliver_local } => {
                if deliver_local {
                    self.accept_fragment(&envelope, now).await;
                }
                if envelope.ttl > 0 {
                    self.relay_bytes(&bytes, envelope.ttl, Some(link)).await;
                }
            }
            RelayDecision::Forward { next_hop } => {
                self.forward_bytes(&bytes, envelope.ttl, next_hop).await;
            }
            RelayDecision::Drop(reason) => {
                debug!(?reason, "fragment dropped");
            }
        }
    }

    async fn accept_fragment(&mut self, envelope: &Envelope, now: u64) {
        match self.reassembler.accept(envelope, now) {
            Ok(Some(parent)) => {
                debug!(sender = %hex::encode(parent.sender), "fragment group reassembled");
                self.deliver(parent).await;
            }
            Ok(None) => {}
            Err(err) => {
                debug!(%err, "fragment rejected");
            }
        }
    }

    async fn on_traffic(&mut self, link: LinkId, envelope: Envelope, bytes: Vec<u8>, now: u64) {
        let decision = self.relay.decide(&envelope, &self.live_neighbors(), now);
        match decision {
            RelayDecision::Deliver => {
                self.store.insert(&envelope, bytes, now);
                self.deliver(envelope).await;
            }
            RelayDecision::Flood { deliver_local } => {
                self.store.insert(&envelope, bytes.clone(), now);
                if envelope.ttl > 0 {
                    self.relay_bytes(&bytes, envelope.ttl, Some(link)).await;
                }
                if deliver_local {
                    self.deliver(envelope).await;
                }
            }
            RelayDecision::Forward { next_hop } => {
                self.forward_bytes(&bytes, envelope.ttl, next_hop).await;
            }
            RelayDecision::Drop(reason) => {
                debug!(?reason, sender = %hex::encode(envelope.sender), "packet dropped");
            }
        }
    }

    async fn deliver(&mut self, envelope: Envelope) {
        let payload = match envelope.decoded_payload(self.config.payload_ceiling) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, sender = %hex::encode(envelope.sender), "payload undecodable");
                return;
            }
        };
        let verified = match (&envelope.signature, self.known_keys.get(&envelope.sender)) {
            (Some(signature), Some(key)) => signing_bytes(&envelope)
                .map(|message| self.verifier.verify(&message, signature, key))
                .unwrap_or(false),
            _ => false,
        };
        self.emit(MeshEvent::Message(ReceivedMessage {
            sender: envelope.sender,
            msg_type: envelope.msg_type,
            payload,
            timestamp_ms: envelope.timestamp_ms,
            verified,
        }));
    }

    // ---- outbound ----

    async fn send_local(
        &mut self,
        msg_type: MessageType,
        recipient: Option<NodeId>,
        payload: Vec<u8>,
        compressible: bool,
    ) -> Result<Option<TransferId>, EngineError> {
        let now = self.clock.now_ms();
        let mut envelope = match recipient {
            None => Envelope::broadcast(msg_type, self.local_id, now, self.config.max_ttl, payload),
            Some(node) => {
                Envelope::direct(msg_type, self.local_id, node, now, self.config.max_ttl, payload)
            }
        };
        if compressible {
            if let Some(compressed) =
                crate::protocol::compress::compress_if_smaller(&envelope.payload)
            {
                envelope.payload = compressed;
                envelope.compressed = true;
            }
        }
        if envelope.payload.len() > Envelope::MAX_PAYLOAD_V1 {
            envelope.version = crate::protocol::VERSION_2;
        }
        if let Some(node) = recipient {
            if let Some(path) = self.topology.shortest_path(&self.local_id, &node) {
                if path.len() > 2 {
                    envelope = envelope.with_route(path[1..path.len() - 1].to_vec());
                }
            }
        }
        envelope.signature = Some(self.signer.sign(&signing_bytes(&envelope)?));

        let encoded = envelope.encode()?;
        self.store.insert(&envelope, encoded.clone(), now);

        let targets = match recipient {
            None => SendTargets::Broadcast,
            Some(node) => SendTargets::Peer(node),
        };

        if encoded.len() <= self.config.max_frame_bytes {
            self.dispatch(encoded, targets).await;
            return Ok(None);
        }

        // Too big for one frame: carve into a paced fragment train.
        let overhead = HEADER_LEN_V2
            + 8
            + if envelope.recipient.is_some() { 8 } else { 0 }
            + if envelope.route.is_empty() {
                0
            } else {
                1 + envelope.route.len() * 8
            };
        let slice_budget = self.config.max_frame_bytes.saturating_sub(overhead);
        let fragments = fragment_envelope(&envelope, slice_budget)?;
        let mut frames = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            frames.push(fragment.encode()?);
        }

        let id = self.transfers.begin(frames.len() as u16);
        self.transfer_targets.insert(id, targets);
        let cancel = Arc::new(AtomicBool::new(false));
        self.transfer_cancels.insert(id, cancel.clone());

        info!(
            transfer = id,
            fragments = frames.len(),
            "starting fragmented transfer"
        );
        let commands = self.commands.clone();
        let pacing = Duration::from_millis(self.config.fragment_pacing_ms);
        tokio::spawn(async move {
            for frame in frames {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if commands
                    .send(EngineCommand::FragmentReady { id, frame })
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(pacing).await;
            }
        });

        Ok(Some(id))
    }

    async fn on_fragment_ready(&mut self, id: TransferId, frame: Vec<u8>) {
        if self.transfers.is_cancelled(id) {
            self.transfer_targets.remove(&id);
            self.transfer_cancels.remove(&id);
            self.transfers.finish(id);
            return;
        }
        let targets = self
            .transfer_targets
            .get(&id)
            .copied()
            .unwrap_or(SendTargets::Broadcast);
        self.dispatch(frame, targets).await;
        if let Some(event) = self.transfers.record_sent(id) {
            let complete = matches!(event, TransferEvent::Complete { .. });
            self.emit(MeshEvent::Transfer(event));
            if complete {
                self.transfer_targets.remove(&id);
                self.transfer_cancels.remove(&id);
            }
        }
    }

    fn on_cancel_transfer(&mut self, id: TransferId) {
        if let Some(flag) = self.transfer_cancels.remove(&id) {
            flag.store(true, Ordering::Relaxed);
        }
        if let Some(event) = self.transfers.cancel(id) {
            self.emit(MeshEvent::Transfer(event));
        }
        // The pacing task observes the flag; nothing else will reference
        // this transfer again.
        self.transfers.finish(id);
        self.transfer_targets.remove(&id);
    }

    /// Send a locally originated frame toward its targets: the direct link
    /// for a known peer, every link otherwise.
    async fn dispatch(&mut self, frame: Vec<u8>, targets: SendTargets) {
        match targets {
            SendTargets::Peer(node) if self.peers.contains_key(&node) => {
                let link = self.peers[&node];
                if let Err(err) = self.transport.send_bytes(link, frame).await {
                    debug!(link, %err, "direct send failed");
                }
            }
            _ => {
                for link in self.links.keys().copied().collect::<Vec<_>>() {
                    if let Err(err) = self.transport.send_bytes(link, frame.clone()).await {
                        debug!(link, %err, "broadcast send failed");
                    }
                }
            }
        }
    }

    /// Rebroadcast received bytes with TTL decremented, skipping the arrival
    /// link. Fan-out covers every open link, bound or not: announce floods
    /// have to cross links that carry no peer yet, and fallback floods may
    /// need a link whose peer binding was just dropped. Every other byte is
    /// untouched, so signatures stay valid.
    async fn relay_bytes(&mut self, bytes: &[u8], ttl: u8, exclude: Option<LinkId>) {
        debug_assert!(ttl > 0);
        let mut frame = bytes.to_vec();
        frame[2] = ttl - 1;
        for link in self.links.keys().copied().collect::<Vec<_>>() {
            if Some(link) == exclude {
                continue;
            }
            if let Err(err) = self.transport.send_bytes(link, frame.clone()).await {
                debug!(link, %err, "relay send failed");
            }
        }
    }

    async fn forward_bytes(&mut self, bytes: &[u8], ttl: u8, next_hop: NodeId) {
        let Some(link) = self.peers.get(&next_hop).copied() else {
            // RelayEngine only forwards to live neighbors; a race with link
            // teardown lands here.
            debug!(next_hop = %hex::encode(next_hop), "next hop vanished, dropping");
            return;
        };
        let mut frame = bytes.to_vec();
        frame[2] = ttl.saturating_sub(1);
        if let Err(err) = self.transport.send_bytes(link, frame).await {
            debug!(link, %err, "forward send failed");
        }
    }

    // ---- periodic work ----

    async fn on_tick(&mut self) {
        let now = self.clock.now_ms();

        for (address, reason) in self.monitor.tick(now) {
            self.disconnect_address(&address, reason).await;
        }

        if now.saturating_sub(self.last_prune_ms) >= self.config.topology_prune_interval_ms {
            self.last_prune_ms = now;
            let pruned = self.topology.prune_stale(now, self.config.topology_stale_ms);
            if pruned > 0 {
                debug!(pruned, "pruned stale topology entries");
            }
            self.reassembler.evict_stale(now);
            self.store.maintain(now);
            self.refresh_confirmations(now);
        }

        if now.saturating_sub(self.last_announce_ms) >= self.config.announce_interval_ms
            && !self.links.is_empty()
        {
            self.broadcast_announce(now).await;
        }

        let due = self.scheduler.poll(now);
        if due.sweep {
            for peer in self.confirmed.iter().copied().collect::<Vec<_>>() {
                self.send_sync_request(peer, now).await;
            }
        }
        for peer in due.one_shots {
            self.send_sync_request(peer, now).await;
        }
    }

    async fn disconnect_address(&mut self, address: &str, reason: BlockReason) {
        let stale: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, info)| info.address == address)
            .map(|(link, _)| *link)
            .collect();
        for link in stale {
            warn!(link, address, ?reason, "disconnecting blocked link");
            self.transport.close(link).await;
            if let Some(info) = self.links.remove(&link) {
                if let Some(peer) = info.peer {
                    self.drop_peer(peer, link);
                }
            }
        }
    }

    async fn broadcast_announce(&mut self, now: u64) {
        self.last_announce_ms = now;
        let neighbors: Vec<NodeId> = self.peers.keys().copied().collect();
        let announcement = Announcement {
            nickname: self.config.nickname.clone(),
            signing_key: self.signer.public_key(),
            neighbors: neighbors.clone(),
        };
        let mut envelope = Envelope::broadcast(
            MessageType::Announce,
            self.local_id,
            now,
            self.config.max_ttl,
            announcement.to_payload(),
        );
        let Ok(message) = signing_bytes(&envelope) else {
            return;
        };
        envelope.signature = Some(self.signer.sign(&message));
        let Ok(frame) = envelope.encode() else {
            return;
        };

        // Our own declaration participates in edge confirmation.
        self.topology
            .apply_announcement(self.local_id, &neighbors, now, now);
        self.store.insert(&envelope, frame.clone(), now);
        self.dispatch(frame, SendTargets::Broadcast).await;
        self.refresh_confirmations(now);
    }

    async fn broadcast_leave(&mut self) {
        let now = self.clock.now_ms();
        let mut envelope = Envelope::broadcast(
            MessageType::Leave,
            self.local_id,
            now,
            self.config.max_ttl,
            Vec::new(),
        );
        if let Ok(message) = signing_bytes(&envelope) {
            envelope.signature = Some(self.signer.sign(&message));
        }
        if let Ok(frame) = envelope.encode() {
            self.dispatch(frame, SendTargets::Broadcast).await;
        }
    }

    async fn send_sync_request(&mut self, peer: NodeId, now: u64) {
        let Some(link) = self.peers.get(&peer).copied() else {
            return;
        };
        let snapshot = build_snapshot(
            &self.store,
            now,
            self.config.gcs_capacity(),
            self.config.gcs_fpr_bits,
        );
        if snapshot.data.len() > self.config.gcs_max_bytes {
            warn!(
                bytes = snapshot.data.len(),
                "snapshot exceeds byte budget, skipping sweep"
            );
            return;
        }
        let mut envelope = Envelope::direct(
            MessageType::RequestSync,
            self.local_id,
            peer,
            now,
            1,
            encode_request(&snapshot),
        );
        let Ok(message) = signing_bytes(&envelope) else {
            return;
        };
        envelope.signature = Some(self.signer.sign(&message));
        let Ok(frame) = envelope.encode() else {
            return;
        };
        debug!(peer = %hex::encode(peer), elements = snapshot.element_count(), "sync request");
        if let Err(err) = self.transport.send_bytes(link, frame).await {
            debug!(link, %err, "sync request send failed");
        }
    }

    // ---- shared helpers ----

    fn live_neighbors(&self) -> HashSet<NodeId> {
        self.peers.keys().copied().collect()
    }

    fn refresh_confirmations(&mut self, now: u64) {
        for peer in self.peers.keys().copied().collect::<Vec<_>>() {
            if self.topology.is_edge_confirmed(&self.local_id, &peer) {
                if self.confirmed.insert(peer) {
                    info!(peer = %hex::encode(peer), "neighbor confirmed");
                    self.scheduler.on_neighbor_confirmed(peer, now);
                    self.emit(MeshEvent::NeighborConfirmed(peer));
                }
            } else if self.confirmed.remove(&peer) {
                self.scheduler.on_neighbor_lost(&peer);
                self.emit(MeshEvent::NeighborLost(peer));
            }
        }
        // Peers that fell out of the topology entirely.
        let gone: Vec<NodeId> = self
            .confirmed
            .iter()
            .filter(|peer| !self.peers.contains_key(*peer))
            .copied()
            .collect();
        for peer in gone {
            self.confirmed.remove(&peer);
            self.scheduler.on_neighbor_lost(&peer);
            self.emit(MeshEvent::NeighborLost(peer));
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            known_nodes: self.topology.node_count(),
            confirmed_neighbors: self.confirmed.len(),
            links: self.links.len(),
            blocked_addresses: self.monitor.report().blocked_addresses,
            stored_packets: self.store.len(),
            stored_bytes: self.store.total_bytes(),
            dedup_entries: self.relay.dedup_len(),
            pending_fragment_groups: self.reassembler.pending_groups(),
            active_transfers: self.transfers.active_count(),
        }
    }

    /// Events use try_send: a consumer that stops draining loses events
    /// rather than wedging the coordinator.
    fn emit(&self, event: MeshEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!(%err, "event channel full, dropping event");
        }
    }
}
