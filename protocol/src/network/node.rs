//! # Node
//!
//! The runtime that ties the network layer together. One [`Node`] owns the
//! peer store and the topologist and drives everything else from a single
//! event loop:
//!
//! ```text
//! transport events ─┐
//! handle commands  ─┤
//! gossip deliveries ┼─> select! ─> PeerStore / Gossip / SyncEngine / TxPool
//! applied blocks   ─┤                 │
//! maintenance tick ─┤                 └─> spawned sends, dials, fetches
//! miner output     ─┘
//! ```
//!
//! Lifecycle:
//!
//! ```text
//! Offline -> Syncing -> Active -> Offline
//! ```
//!
//! A node is `Offline` with no connected peer, `Syncing` until one chain-tip
//! probe after connecting has finished, and `Active` afterwards. Dropping
//! to zero peers makes it `Offline` again and the next connection starts a
//! fresh catch-up.
//!
//! ## Design Decisions
//!
//! - Nothing that awaits the network runs on the loop itself, except our
//!   own handshake, which must hit the wire before any sealed frame. Fetches,
//!   dials and relays run on spawned tasks and report back through the
//!   command channel.
//! - Gossip topic handlers only forward the event into an unbounded queue
//!   the loop drains. Handlers never suspend and never touch node state.
//! - Outside code gets a [`NodeHandle`]: snapshots through `watch`, events
//!   through `broadcast`, requests through the command channel. It never
//!   sees the peer store itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::gossip::{Gossip, GossipError, GossipEvent, GossipOutcome, GossipStats, RelayPlan, Topic};
use super::link::{Inbound, Link, LocalInfo, ProtocolError};
use super::messager::{Envelope, Messager, Request, Response};
use super::peer_store::{PeerAnnouncement, PeerRecord, PeerStatus, PeerStore};
use super::pool::{PoolError, TxPool};
use super::sync::{
    BlockSource, CandidateOutcome, SyncEngine, SyncError, SyncRequest, SyncResponse, SyncStats,
    TransactionValidator,
};
use super::topology::{TopologyAction, Topologist};
use super::transport::{Transport, TransportEvent};
use crate::chain::{address_of, Address, BlockCandidate, FinalizedBlock, Transaction};
use crate::config::{now_ms, ConfigError, NodeConfig, MAX_CANDIDATE_TRANSACTIONS, WORKER_TERMINATE_GRACE};
use crate::crypto::hash::{parse_hex32, short_hex, Hash32};
use crate::crypto::keys::{NodeKeypair, PeerId};
use crate::storage::BlockStore;
use crate::workers::{check_batch, spawn_miner, InlineValidator, MinerRequest, MinerResponse, ValidationPool, WorkerHandle};

const COMMAND_QUEUE_DEPTH: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Ticks between rounds of tip probes and neighbor refreshes once caught up.
const REFRESH_EVERY_TICKS: u64 = 15;

// ---------------------------------------------------------------------------
// Public Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// No connected peer.
    Offline,
    /// Connected, first catch-up with the network not finished yet.
    Syncing,
    /// Connected and caught up.
    Active,
}

/// Read-only view of the node, republished whenever it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub peer_id: PeerId,
    pub status: NodeStatus,
    pub height: u64,
    pub head_hash: String,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub pending_transactions: usize,
    /// Hashes per second of the last sealed block, zero when not mining.
    pub hash_rate: f64,
    pub gossip: GossipStats,
    pub sync: SyncStats,
}

/// Pushed to every [`NodeHandle::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum NodeEvent {
    StatusChanged(NodeStatus),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    BlockApplied { index: u64, hash: String },
    BlockMined { index: u64, hash: String },
    TransactionAccepted { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeQuery {
    Peers,
    BlockByIndex(u64),
    BlockByHash(Hash32),
    Balance(Address),
    /// The candidate held for the next index.
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAnswer {
    Peers(Vec<PeerRecord>),
    Block(Option<FinalizedBlock>),
    Balance(u64),
    Candidate(Option<BlockCandidate>),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("sync: {0}")]
    Sync(#[from] SyncError),

    #[error("transaction rejected: {0}")]
    InvalidTransaction(String),

    #[error("pool: {0}")]
    Pool(#[from] PoolError),

    #[error("gossip: {0}")]
    Gossip(#[from] GossipError),

    #[error("node is not running")]
    Stopped,
}

// ---------------------------------------------------------------------------
// Internal Messages
// ---------------------------------------------------------------------------

enum Command {
    Submit {
        transaction: Transaction,
        reply: oneshot::Sender<Result<Hash32, NodeError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    DialFailed {
        peer: PeerId,
        reason: String,
    },
    /// A chain-tip probe finished.
    Probed {
        peer: PeerId,
        result: Result<usize, String>,
    },
    /// A gossiped block was processed.
    BlockHandled {
        peer: PeerId,
        result: Result<usize, String>,
    },
    Discovered {
        peer: PeerId,
        announcements: Vec<PeerAnnouncement>,
    },
    Mined(Result<FinalizedBlock, String>),
}

/// A gossip event handed over by a topic handler.
struct Delivery {
    from: PeerId,
    originator: PeerId,
    event: GossipEvent,
}

struct Inbox {
    transport: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    applied: broadcast::Receiver<FinalizedBlock>,
    shutdown: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<NodeSnapshot>,
    events: broadcast::Sender<NodeEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    sync: Arc<SyncEngine>,
}

impl NodeHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that wakes on every new snapshot.
    pub fn watch(&self) -> watch::Receiver<NodeSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn query(&self, query: NodeQuery) -> Result<QueryAnswer, NodeError> {
        let answer = match query {
            NodeQuery::Peers => {
                let (reply, rx) = oneshot::channel();
                self.commands
                    .send(Command::Peers { reply })
                    .await
                    .map_err(|_| NodeError::Stopped)?;
                QueryAnswer::Peers(rx.await.map_err(|_| NodeError::Stopped)?)
            }
            NodeQuery::BlockByIndex(index) => QueryAnswer::Block(self.sync.block(index)),
            NodeQuery::BlockByHash(hash) => QueryAnswer::Block(self.sync.block_by_hash(&hash)),
            NodeQuery::Balance(address) => QueryAnswer::Balance(self.sync.balance(&address)),
            NodeQuery::Candidate => QueryAnswer::Candidate(self.sync.candidate()),
        };
        Ok(answer)
    }

    /// Validate `transaction` against the chain, add it to the pool and
    /// gossip it. Returns the transaction id.
    pub async fn submit_transaction(&self, transaction: Transaction) -> Result<Hash32, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { transaction, reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Ask the event loop to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    config: NodeConfig,
    keypair: Arc<NodeKeypair>,
    local: PeerId,
    transport: Arc<dyn Transport>,
    link: Arc<Link>,
    messager: Arc<Messager>,
    gossip: Arc<Gossip>,
    sync: Arc<SyncEngine>,
    pool: Arc<TxPool>,
    validation: Option<Arc<ValidationPool>>,
    peers: PeerStore,
    topologist: Topologist,
    status: NodeStatus,
    caught_up: bool,
    probes_in_flight: usize,
    ticks: u64,
    miner: Option<WorkerHandle<MinerRequest, MinerResponse>>,
    /// Slot the miner is working on.
    mining_slot: Option<(u64, Hash32)>,
    hash_rate: f64,
    commands_tx: mpsc::Sender<Command>,
    inbox: Option<Inbox>,
    snapshot_tx: watch::Sender<NodeSnapshot>,
    snapshot_rx: watch::Receiver<NodeSnapshot>,
    events_tx: broadcast::Sender<NodeEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Node {
    /// Wire up a node. Loads the chain from `store` and, when configured,
    /// starts the validation workers, so this must run inside a Tokio
    /// runtime.
    pub fn new(
        config: NodeConfig,
        keypair: Arc<NodeKeypair>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let local = keypair.peer_id();
        let link = Arc::new(Link::new(Arc::clone(&keypair)));
        let messager = Arc::new(Messager::new(
            Arc::clone(&transport),
            Arc::clone(&link),
            config.messager.clone(),
        ));

        let validation = (config.validation_workers > 0)
            .then(|| Arc::new(ValidationPool::spawn(config.validation_workers)));
        let validator: Arc<dyn TransactionValidator> = match &validation {
            Some(pool) => Arc::clone(pool) as Arc<dyn TransactionValidator>,
            None => Arc::new(InlineValidator),
        };
        let source = Arc::clone(&messager) as Arc<dyn BlockSource>;
        let sync = Arc::new(SyncEngine::open(config.sync.clone(), store, source, validator)?);

        let gossip = Arc::new(Gossip::new(config.gossip.clone(), Arc::clone(&keypair)));
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        for topic in Topic::ALL {
            let tx = deliveries_tx.clone();
            gossip.subscribe(topic, move |envelope| {
                let _ = tx.send(Delivery {
                    from: envelope.sender.clone(),
                    originator: envelope.originator.clone(),
                    event: envelope.event.clone(),
                });
            });
        }

        let now = now_ms();
        let mut peers = PeerStore::new(local.clone());
        for seed in &config.bootstrap {
            peers.learn(
                &PeerAnnouncement {
                    peer_id: seed.peer_id.clone(),
                    is_public: true,
                    address: seed.address.clone(),
                    neighbors: Vec::new(),
                },
                now,
            );
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (height, head) = sync.tip();
        let (snapshot_tx, snapshot_rx) = watch::channel(NodeSnapshot {
            peer_id: local.clone(),
            status: NodeStatus::Offline,
            height,
            head_hash: hex::encode(head),
            connected_peers: 0,
            known_peers: peers.len(),
            pending_transactions: 0,
            hash_rate: 0.0,
            gossip: GossipStats::default(),
            sync: sync.stats(),
        });
        let inbox = Inbox {
            transport: transport_events,
            commands: commands_rx,
            deliveries: deliveries_rx,
            applied: sync.subscribe_applied(),
            shutdown: shutdown_rx,
        };

        Ok(Self {
            topologist: Topologist::new(config.topology.clone()),
            pool: Arc::new(TxPool::new(config.pool.clone())),
            config,
            keypair,
            local,
            transport,
            link,
            messager,
            gossip,
            sync,
            validation,
            peers,
            status: NodeStatus::Offline,
            caught_up: false,
            probes_in_flight: 0,
            ticks: 0,
            miner: None,
            mining_slot: None,
            hash_rate: 0.0,
            commands_tx,
            inbox: Some(inbox),
            snapshot_tx,
            snapshot_rx,
            events_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            peer_id: self.local.clone(),
            commands: self.commands_tx.clone(),
            snapshot: self.snapshot_rx.clone(),
            events: self.events_tx.clone(),
            shutdown: Arc::clone(&self.shutdown_tx),
            sync: Arc::clone(&self.sync),
        }
    }

    /// Run the event loop on a new task.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<Result<(), NodeError>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Run until [`NodeHandle::shutdown`] or until the transport closes.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let Some(mut inbox) = self.inbox.take() else {
            return Err(NodeError::Stopped);
        };
        self.start_miner().await;
        info!(
            peer = %self.local.short(),
            height = self.sync.height(),
            mining = self.miner.is_some(),
            "node started"
        );

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.maintenance_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = inbox.shutdown.changed() => {
                    if changed.is_err() || *inbox.shutdown.borrow() {
                        break;
                    }
                }
                event = inbox.transport.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => {
                        warn!("transport closed, stopping node");
                        break;
                    }
                },
                Some(command) = inbox.commands.recv() => self.on_command(command).await,
                Some(delivery) = inbox.deliveries.recv() => self.on_delivery(delivery).await,
                applied = inbox.applied.recv() => match applied {
                    Ok(block) => self.on_applied(block).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "applied-block feed lagged");
                        self.refresh_candidate().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = tick.tick() => self.maintain().await,
                response = next_mined(&mut self.miner) => self.on_miner(response),
            }
            self.update_status();
            self.publish();
        }

        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        for peer in self.peers.connected() {
            self.transport.disconnect(&peer).await;
        }
        if let Some(miner) = self.miner.take() {
            miner.terminate(WORKER_TERMINATE_GRACE).await;
        }
        if let Some(validation) = &self.validation {
            validation.shutdown(WORKER_TERMINATE_GRACE).await;
        }
        if self.status != NodeStatus::Offline {
            self.status = NodeStatus::Offline;
            let _ = self.events_tx.send(NodeEvent::StatusChanged(NodeStatus::Offline));
        }
        self.publish();
        info!(peer = %self.local.short(), height = self.sync.height(), "node stopped");
    }

    // -- Transport ----------------------------------------------------------

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, outbound } => {
                trace!(peer = %peer.short(), outbound, "connection up");
                let info = self.local_info();
                match self.link.begin(&peer, &info) {
                    Ok(frame) => {
                        if let Err(err) = self.transport.send(&peer, frame).await {
                            debug!(peer = %peer.short(), error = %err, "handshake not sent");
                        }
                    }
                    Err(err) => warn!(peer = %peer.short(), error = %err, "cannot build handshake"),
                }
            }
            TransportEvent::Disconnected { peer } => self.on_disconnected(peer),
            TransportEvent::Message { peer, bytes } => self.on_frame(peer, bytes).await,
        }
    }

    async fn on_frame(&mut self, peer: PeerId, bytes: Vec<u8>) {
        let now = now_ms();
        self.peers.touch(&peer, now);
        let info = self.local_info();
        match self.link.receive(&peer, &bytes, &info) {
            Ok(Inbound::Established { announcement, reply }) => {
                if let Some(frame) = reply {
                    if let Err(err) = self.transport.send(&peer, frame).await {
                        debug!(peer = %peer.short(), error = %err, "handshake reply not sent");
                    }
                }
                self.on_established(peer, announcement, now);
            }
            Ok(Inbound::Payload(plaintext)) => match Envelope::decode(&plaintext) {
                Ok(envelope) => self.on_envelope(peer, envelope, now),
                Err(err) => debug!(peer = %peer.short(), error = %err, "undecodable envelope dropped"),
            },
            Err(
                err @ (ProtocolError::IdentityMismatch(_)
                | ProtocolError::BadSignature(_)
                | ProtocolError::VersionMismatch { .. }),
            ) => {
                warn!(peer = %peer.short(), error = %err, "handshake refused, closing connection");
                self.spawn_disconnect(peer);
            }
            Err(err) => debug!(peer = %peer.short(), error = %err, "frame dropped"),
        }
    }

    fn on_established(&mut self, peer: PeerId, announcement: PeerAnnouncement, now: u64) {
        self.peers.learn(&announcement, now);
        self.peers.dial_succeeded(&peer, now);
        info!(peer = %peer.short(), public = announcement.is_public, "peer connected");
        let _ = self.events_tx.send(NodeEvent::PeerConnected(peer.clone()));

        self.broadcast(GossipEvent::PeerJoined(self.own_announcement()));
        self.probe(peer.clone());
        self.ask_neighbors(peer);
    }

    fn on_disconnected(&mut self, peer: PeerId) {
        let now = now_ms();
        self.link.reset(&peer);
        self.messager.fail_peer(&peer);
        match self.peers.status(&peer) {
            Some(PeerStatus::Connected) => {
                self.peers.disconnected(&peer, now);
                info!(peer = %peer.short(), "peer disconnected");
                let _ = self.events_tx.send(NodeEvent::PeerDisconnected(peer.clone()));
                self.broadcast(GossipEvent::PeerLeft { peer });
            }
            Some(PeerStatus::Connecting) => {
                let outcome = self.peers.dial_failed(&peer, now, self.topologist.config());
                debug!(peer = %peer.short(), ?outcome, "connection lost during handshake");
            }
            _ => {}
        }
    }

    fn on_envelope(&mut self, peer: PeerId, envelope: Envelope, now: u64) {
        match envelope {
            Envelope::Request { id, body } => {
                let response = match body {
                    Request::Sync(request) => Response::Sync(self.sync.process_sync_request(request)),
                    Request::GetNeighbors => Response::Neighbors(self.neighbor_announcements()),
                };
                let messager = Arc::clone(&self.messager);
                tokio::spawn(async move {
                    if let Err(err) = messager.respond(&peer, id, response).await {
                        debug!(peer = %peer.short(), id, error = %err, "response not sent");
                    }
                });
            }
            Envelope::Response { id, body } => self.messager.on_response(&peer, id, body),
            Envelope::Gossip(envelope) => {
                let neighbors = self.neighbors();
                if let GossipOutcome::Accepted { relay: Some(plan) } =
                    self.gossip.handle_incoming(&peer, envelope, &neighbors, now)
                {
                    self.send_plan(plan);
                }
            }
        }
    }

    // -- Gossip -------------------------------------------------------------

    async fn on_delivery(&mut self, delivery: Delivery) {
        let now = now_ms();
        match delivery.event {
            GossipEvent::PeerJoined(announcement) => {
                if self.peers.learn(&announcement, now) {
                    debug!(peer = %announcement.peer_id.short(), via = %delivery.from.short(), "peer discovered by gossip");
                }
            }
            GossipEvent::PeerLeft { peer } => {
                let remaining = self.peers.get(&delivery.originator).map(|record| {
                    record
                        .neighbors
                        .iter()
                        .filter(|n| **n != peer)
                        .cloned()
                        .collect::<Vec<_>>()
                });
                if let Some(remaining) = remaining {
                    self.peers.update_neighbors(&delivery.originator, remaining, now);
                }
            }
            GossipEvent::BlockCandidate(candidate) => self.on_candidate(candidate).await,
            GossipEvent::BlockFinalized(block) => self.spawn_block(delivery.from, block),
            GossipEvent::Transaction(transaction) => match self.admit(transaction) {
                Ok(_) => {}
                Err(err) => trace!(from = %delivery.from.short(), error = %err, "gossiped transaction ignored"),
            },
        }
    }

    async fn on_candidate(&mut self, candidate: BlockCandidate) {
        let local = candidate.proposer == self.local;
        let index = candidate.index;
        match self.sync.offer_candidate(candidate.clone()) {
            Ok(outcome @ (CandidateOutcome::Accepted | CandidateOutcome::Superseded | CandidateOutcome::Duplicate))
                if local =>
            {
                if outcome != CandidateOutcome::Duplicate {
                    self.broadcast(GossipEvent::BlockCandidate(candidate.clone()));
                }
                let slot = candidate.slot();
                if self.mining_slot == Some(slot) {
                    return;
                }
                if let Some(miner) = &self.miner {
                    match miner.send(MinerRequest::NewCandidate(candidate)).await {
                        Ok(()) => self.mining_slot = Some(slot),
                        Err(err) => warn!(error = %err, "miner unreachable"),
                    }
                }
            }
            Ok(outcome) => trace!(index, local, ?outcome, "candidate offered"),
            Err(err) => debug!(index, error = %err, "candidate rejected"),
        }
    }

    /// Validate against the current chain and add to the pool.
    fn admit(&self, transaction: Transaction) -> Result<Hash32, NodeError> {
        if self.pool.contains(&transaction.id()) {
            return Err(PoolError::Duplicate.into());
        }
        let batch = std::slice::from_ref(&transaction);
        let context = self.sync.context_for(batch);
        check_batch(batch, &context).map_err(NodeError::InvalidTransaction)?;
        let id = self.pool.add(transaction)?;
        debug!(id = %short_hex(&id), pending = self.pool.len(), "transaction pooled");
        let _ = self.events_tx.send(NodeEvent::TransactionAccepted { id: hex::encode(id) });
        Ok(id)
    }

    fn broadcast(&self, event: GossipEvent) {
        match self.gossip.broadcast(event, &self.neighbors(), now_ms()) {
            Ok(plan) => self.send_plan(plan),
            Err(err) => warn!(error = %err, "cannot originate gossip"),
        }
    }

    fn send_plan(&self, plan: RelayPlan) {
        if plan.targets.is_empty() {
            return;
        }
        let messager = Arc::clone(&self.messager);
        tokio::spawn(async move {
            for target in &plan.targets {
                if let Err(err) = messager.send_gossip(target, &plan.envelope).await {
                    trace!(peer = %target.short(), error = %err, "gossip send failed");
                }
            }
        });
    }

    // -- Commands -----------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { transaction, reply } => {
                let outcome = self.admit(transaction.clone());
                if outcome.is_ok() {
                    self.broadcast(GossipEvent::Transaction(transaction));
                }
                let _ = reply.send(outcome);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peers.snapshot());
            }
            Command::DialFailed { peer, reason } => {
                if self.peers.status(&peer) == Some(PeerStatus::Connecting) {
                    let outcome = self.peers.dial_failed(&peer, now_ms(), self.topologist.config());
                    debug!(peer = %peer.short(), %reason, ?outcome, "dial failed");
                }
            }
            Command::Probed { peer, result } => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                match result {
                    Ok(applied) => {
                        if !self.caught_up {
                            info!(peer = %peer.short(), applied, height = self.sync.height(), "caught up with network");
                        }
                        self.caught_up = true;
                    }
                    Err(reason) => debug!(peer = %peer.short(), %reason, "tip probe failed"),
                }
            }
            Command::BlockHandled { peer, result } => match result {
                Ok(applied) => trace!(peer = %peer.short(), applied, "gossiped block handled"),
                Err(reason) => debug!(peer = %peer.short(), %reason, "gossiped block discarded"),
            },
            Command::Discovered { peer, announcements } => {
                let now = now_ms();
                let ids: Vec<PeerId> = announcements.iter().map(|a| a.peer_id.clone()).collect();
                let mut learned = 0;
                for announcement in &announcements {
                    if self.peers.learn(announcement, now) {
                        learned += 1;
                    }
                }
                self.peers.update_neighbors(&peer, ids, now);
                if learned > 0 {
                    debug!(peer = %peer.short(), learned, "peers learned from neighbor list");
                }
            }
            Command::Mined(Ok(block)) => {
                let _ = self.events_tx.send(NodeEvent::BlockMined {
                    index: block.index,
                    hash: block.hash_hex(),
                });
                self.broadcast(GossipEvent::BlockFinalized(block));
            }
            Command::Mined(Err(reason)) => warn!(%reason, "mined block not applied"),
        }
    }

    // -- Chain --------------------------------------------------------------

    async fn on_applied(&mut self, block: FinalizedBlock) {
        let pruned = self.pool.prune_block(&block);
        debug!(index = block.index, hash = %block.short_hash(), pruned, "block applied");
        let _ = self.events_tx.send(NodeEvent::BlockApplied {
            index: block.index,
            hash: block.hash_hex(),
        });
        if self.sync.tip().1 == block.hash {
            self.refresh_candidate().await;
        }
    }

    /// Ask `peer` for its chain tip and catch up to it.
    fn probe(&mut self, peer: PeerId) {
        self.probes_in_flight += 1;
        let fallbacks = self.fallbacks(&peer);
        let messager = Arc::clone(&self.messager);
        let sync = Arc::clone(&self.sync);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = match messager.request(&peer, Request::Sync(SyncRequest::GetChainTip)).await {
                Ok(Response::Sync(SyncResponse::ChainTip { index, .. })) => sync
                    .on_announcement(&peer, index, &fallbacks)
                    .await
                    .map_err(|e| e.to_string()),
                Ok(other) => Err(format!("unexpected reply {other:?}")),
                Err(err) => Err(err.to_string()),
            };
            let _ = commands.send(Command::Probed { peer, result }).await;
        });
    }

    fn spawn_block(&self, peer: PeerId, block: FinalizedBlock) {
        let fallbacks = self.fallbacks(&peer);
        let sync = Arc::clone(&self.sync);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = sync
                .on_block(&peer, block, &fallbacks)
                .await
                .map_err(|e| e.to_string());
            let _ = commands.send(Command::BlockHandled { peer, result }).await;
        });
    }

    fn ask_neighbors(&self, peer: PeerId) {
        let messager = Arc::clone(&self.messager);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            match messager.request(&peer, Request::GetNeighbors).await {
                Ok(Response::Neighbors(announcements)) => {
                    let _ = commands.send(Command::Discovered { peer, announcements }).await;
                }
                Ok(other) => debug!(peer = %peer.short(), reply = ?other, "unexpected neighbor reply"),
                Err(err) => debug!(peer = %peer.short(), error = %err, "neighbor request failed"),
            }
        });
    }

    // -- Mining -------------------------------------------------------------

    async fn start_miner(&mut self) {
        if !self.config.mining.enabled {
            return;
        }
        let reward: Address = self
            .config
            .mining
            .reward_address
            .as_deref()
            .and_then(parse_hex32)
            .unwrap_or_else(|| address_of(&self.keypair.public_key_bytes()));
        self.miner = Some(spawn_miner(
            Arc::clone(&self.keypair),
            reward,
            self.config.mining.bet,
        ));
        self.refresh_candidate().await;
    }

    /// Build a candidate on the current head from the pool and hand it to
    /// the miner.
    async fn refresh_candidate(&mut self) {
        if self.miner.is_none() {
            return;
        }
        let (height, head) = self.sync.tip();
        let pending = self.pool.select(MAX_CANDIDATE_TRANSACTIONS);
        let context = self.sync.context_for(&pending);
        let transactions: Vec<Transaction> = pending
            .into_iter()
            .filter(|tx| check_batch(std::slice::from_ref(tx), &context).is_ok())
            .collect();
        let candidate = BlockCandidate {
            index: height + 1,
            prev_hash: head,
            timestamp: now_ms(),
            proposer: self.local.clone(),
            transactions,
            nonce: 0,
            difficulty: self.config.mining.difficulty,
        };
        debug!(index = candidate.index, txs = candidate.transactions.len(), "new local candidate");
        self.on_candidate(candidate).await;
    }

    fn on_miner(&mut self, response: Option<MinerResponse>) {
        match response {
            Some(MinerResponse::Result(block)) => {
                if block.prev_hash != self.sync.tip().1 {
                    debug!(index = block.index, "sealed block is stale");
                    return;
                }
                self.mining_slot = None;
                let sync = Arc::clone(&self.sync);
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    let result = sync
                        .apply_local(block.clone())
                        .await
                        .map(|()| block)
                        .map_err(|e| e.to_string());
                    let _ = commands.send(Command::Mined(result)).await;
                });
            }
            Some(MinerResponse::HashRate(rate)) => self.hash_rate = rate,
            Some(MinerResponse::Error(reason)) => warn!(%reason, "miner reported an error"),
            Some(MinerResponse::Paused(paused)) => debug!(paused, "miner pause state"),
            None => {
                warn!("miner stopped unexpectedly");
                self.miner = None;
                self.mining_slot = None;
            }
        }
    }

    // -- Maintenance --------------------------------------------------------

    async fn maintain(&mut self) {
        self.ticks += 1;
        let now = now_ms();
        let policy = self.topologist.config().clone();

        let report = self.peers.expire(now, &policy);
        for (peer, outcome) in &report.timed_out {
            debug!(peer = %peer.short(), ?outcome, "dial timed out");
        }
        if !report.forgotten.is_empty() {
            debug!(forgotten = report.forgotten.len(), "silent peers forgotten");
        }

        let actions = {
            let mut rng = rand::thread_rng();
            self.topologist.plan(&self.peers, now, &mut rng)
        };
        for action in actions {
            match action {
                TopologyAction::Dial(peer) => self.dial(peer, now, policy.dial_timeout_ms),
                TopologyAction::Drop { peer, reason } => {
                    debug!(peer = %peer.short(), ?reason, "dropping neighbor");
                    self.spawn_disconnect(peer);
                }
            }
        }

        self.gossip.prune(now);

        let neighbors = self.neighbors();
        if !self.caught_up && self.probes_in_flight == 0 {
            if let Some(peer) = pick(&neighbors) {
                self.probe(peer);
            }
        } else if self.ticks % REFRESH_EVERY_TICKS == 0 {
            if let Some(peer) = pick(&neighbors) {
                if self.probes_in_flight == 0 {
                    self.probe(peer);
                }
            }
            for peer in neighbors {
                self.ask_neighbors(peer);
            }
        }

        let tip = self.sync.tip();
        if self.miner.is_some() && self.mining_slot != Some((tip.0 + 1, tip.1)) {
            self.refresh_candidate().await;
        }
    }

    fn dial(&mut self, peer: PeerId, now: u64, timeout_ms: u64) {
        if let Err(err) = self.peers.begin_dial(&peer, now, timeout_ms) {
            trace!(peer = %peer.short(), error = %err, "dial skipped");
            return;
        }
        let address = self.peers.get(&peer).and_then(|r| r.address.clone());
        let transport = Arc::clone(&self.transport);
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let attempt = transport.connect(&peer, address.as_deref());
            let reason = match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("no connection after {timeout_ms} ms"),
            };
            let _ = commands.send(Command::DialFailed { peer, reason }).await;
        });
    }

    fn spawn_disconnect(&self, peer: PeerId) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move { transport.disconnect(&peer).await });
    }

    // -- Views --------------------------------------------------------------

    /// Connected peers with an established session.
    fn neighbors(&self) -> Vec<PeerId> {
        self.peers
            .connected()
            .into_iter()
            .filter(|peer| self.link.is_established(peer))
            .collect()
    }

    fn fallbacks(&self, primary: &PeerId) -> Vec<PeerId> {
        self.neighbors()
            .into_iter()
            .filter(|peer| peer != primary)
            .collect()
    }

    fn local_info(&self) -> LocalInfo {
        LocalInfo {
            is_public: self.config.is_public,
            listen_address: self.config.listen_address.clone(),
            neighbors: self.peers.connected(),
        }
    }

    fn own_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: self.local.clone(),
            is_public: self.config.is_public,
            address: self.config.listen_address.clone(),
            neighbors: self.peers.connected(),
        }
    }

    fn neighbor_announcements(&self) -> Vec<PeerAnnouncement> {
        self.peers
            .records()
            .filter(|r| r.status == PeerStatus::Connected)
            .map(|r| PeerAnnouncement {
                peer_id: r.id.clone(),
                is_public: r.is_public,
                address: r.address.clone(),
                neighbors: r.neighbors.iter().cloned().collect(),
            })
            .collect()
    }

    fn update_status(&mut self) {
        let connected = self.peers.connected().len();
        if connected == 0 {
            self.caught_up = false;
        }
        let next = match (connected, self.caught_up) {
            (0, _) => NodeStatus::Offline,
            (_, false) => NodeStatus::Syncing,
            (_, true) => NodeStatus::Active,
        };
        if next != self.status {
            info!(from = ?self.status, to = ?next, peers = connected, "node status changed");
            self.status = next;
            let _ = self.events_tx.send(NodeEvent::StatusChanged(next));
        }
    }

    fn publish(&self) {
        let (height, head) = self.sync.tip();
        let next = NodeSnapshot {
            peer_id: self.local.clone(),
            status: self.status,
            height,
            head_hash: hex::encode(head),
            connected_peers: self.peers.connected().len(),
            known_peers: self.peers.len(),
            pending_transactions: self.pool.len(),
            hash_rate: self.hash_rate,
            gossip: self.gossip.stats(),
            sync: self.sync.stats(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", &self.local)
            .field("status", &self.status)
            .field("peers", &self.peers.len())
            .finish()
    }
}

async fn next_mined(miner: &mut Option<WorkerHandle<MinerRequest, MinerResponse>>) -> Option<MinerResponse> {
    match miner {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

fn pick(peers: &[PeerId]) -> Option<PeerId> {
    use rand::seq::SliceRandom;
    peers.choose(&mut rand::thread_rng()).cloned()
}
