//! # Gossip Protocol
//!
//! Epidemic propagation of typed events. When a node accepts a new
//! envelope it runs the local handlers for its topic and forwards it to a
//! random subset (fanout) of its neighbors, which do the same.
//!
//! ## Deduplication
//!
//! An envelope is identified by `BLAKE3(topic || originator || event)`.
//! Nodes keep the ids they have seen together with the first-seen time.
//! A known id is dropped without running handlers or relaying, so handling
//! the same envelope twice has the same effect as handling it once.
//!
//! Eviction is by age (`seen_retention_ms`) and by size (down to 75% of
//! `seen_capacity`), but an id younger than `propagation_window_ms` is
//! never evicted. Otherwise a slow copy still crossing the network could be
//! accepted a second time.
//!
//! ## Hop budget
//!
//! Every envelope carries `hops_remaining`. A relay decrements it and an
//! envelope that arrives with zero is processed but not forwarded. Incoming
//! values are clamped to the local `max_hops`, so a peer cannot buy extra
//! reach by inflating the counter.
//!
//! ## Route
//!
//! Each relay appends itself to `route`. The route is only for
//! diagnostics. It is not signed, so nothing here trusts it beyond
//! bounding its length.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::peer_store::PeerAnnouncement;
use crate::chain::{BlockCandidate, FinalizedBlock, Transaction};
use crate::config::{
    GOSSIP_FANOUT, GOSSIP_MAX_HOPS, GOSSIP_PROPAGATION_WINDOW, GOSSIP_SEEN_CAPACITY,
    GOSSIP_SEEN_RETENTION, GOSSIP_SIGNATURE_CONTEXT,
};
use crate::crypto::hash::{blake3_hash_multi, short_hex, Hash32};
use crate::crypto::keys::{NodeKeypair, NodeSignature, PeerId};
use crate::crypto::signatures::verify_peer;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Hop budget given to originated envelopes and the clamp for incoming ones.
    pub max_hops: u8,
    /// Number of neighbors each envelope is forwarded to.
    pub fanout: usize,
    /// Size bound of the seen-set.
    pub seen_capacity: usize,
    pub seen_retention_ms: u64,
    /// Ids younger than this are never evicted.
    pub propagation_window_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_hops: GOSSIP_MAX_HOPS,
            fanout: GOSSIP_FANOUT,
            seen_capacity: GOSSIP_SEEN_CAPACITY,
            seen_retention_ms: GOSSIP_SEEN_RETENTION.as_millis() as u64,
            propagation_window_ms: GOSSIP_PROPAGATION_WINDOW.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    PeerJoined,
    PeerLeft,
    BlockCandidate,
    BlockFinalized,
    Transaction,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::PeerJoined,
        Topic::PeerLeft,
        Topic::BlockCandidate,
        Topic::BlockFinalized,
        Topic::Transaction,
    ];

    fn tag(self) -> u8 {
        match self {
            Topic::PeerJoined => 1,
            Topic::PeerLeft => 2,
            Topic::BlockCandidate => 3,
            Topic::BlockFinalized => 4,
            Topic::Transaction => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipEvent {
    PeerJoined(PeerAnnouncement),
    PeerLeft { peer: PeerId },
    BlockCandidate(BlockCandidate),
    BlockFinalized(FinalizedBlock),
    Transaction(Transaction),
}

impl GossipEvent {
    pub fn topic(&self) -> Topic {
        match self {
            GossipEvent::PeerJoined(_) => Topic::PeerJoined,
            GossipEvent::PeerLeft { .. } => Topic::PeerLeft,
            GossipEvent::BlockCandidate(_) => Topic::BlockCandidate,
            GossipEvent::BlockFinalized(_) => Topic::BlockFinalized,
            GossipEvent::Transaction(_) => Topic::Transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GossipError {
    #[error("event encoding: {0}")]
    Codec(String),

    #[error("route of {len} entries exceeds {max}")]
    RouteTooLong { len: usize, max: usize },

    #[error("envelope id does not match its contents")]
    IdMismatch,

    #[error("bad originator signature from {0}")]
    BadSignature(PeerId),

    #[error("envelope claims sender {claimed} but arrived from {actual}")]
    SenderMismatch { claimed: PeerId, actual: PeerId },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub id: Hash32,
    pub event: GossipEvent,
    /// The peer that handed us this copy.
    pub sender: PeerId,
    pub originator: PeerId,
    /// Originator's signature over `GOSSIP_SIGNATURE_CONTEXT || id`.
    pub signature: NodeSignature,
    pub hops_remaining: u8,
    pub route: Vec<PeerId>,
}

impl GossipEnvelope {
    pub fn compute_id(originator: &PeerId, event: &GossipEvent) -> Result<Hash32, GossipError> {
        let canonical = bincode::serialize(event).map_err(|e| GossipError::Codec(e.to_string()))?;
        Ok(blake3_hash_multi(&[
            &[event.topic().tag()],
            originator.as_str().as_bytes(),
            &canonical,
        ]))
    }

    fn signing_bytes(id: &Hash32) -> Vec<u8> {
        let mut msg = Vec::with_capacity(GOSSIP_SIGNATURE_CONTEXT.len() + id.len());
        msg.extend_from_slice(GOSSIP_SIGNATURE_CONTEXT);
        msg.extend_from_slice(id);
        msg
    }

    /// A freshly signed envelope with a full hop budget.
    pub fn originate(keypair: &NodeKeypair, event: GossipEvent, max_hops: u8) -> Result<Self, GossipError> {
        let originator = keypair.peer_id();
        let id = Self::compute_id(&originator, &event)?;
        Ok(Self {
            id,
            signature: keypair.sign(&Self::signing_bytes(&id)),
            event,
            sender: originator.clone(),
            route: vec![originator.clone()],
            originator,
            hops_remaining: max_hops,
        })
    }

    /// The copy `local` forwards, or `None` once the budget is spent.
    pub fn forwarded(&self, local: &PeerId, max_hops: u8) -> Option<Self> {
        let hops = self.hops_remaining.min(max_hops);
        if hops == 0 {
            return None;
        }
        let mut route = self.route.clone();
        route.push(local.clone());
        Some(Self {
            sender: local.clone(),
            hops_remaining: hops - 1,
            route,
            ..self.clone()
        })
    }

    /// Structural checks: route length, id and originator signature.
    pub fn verify(&self, max_hops: u8) -> Result<(), GossipError> {
        let max = max_hops as usize + 1;
        if self.route.len() > max {
            return Err(GossipError::RouteTooLong {
                len: self.route.len(),
                max,
            });
        }
        if Self::compute_id(&self.originator, &self.event)? != self.id {
            return Err(GossipError::IdMismatch);
        }
        if !verify_peer(&self.originator, &Self::signing_bytes(&self.id), &self.signature) {
            return Err(GossipError::BadSignature(self.originator.clone()));
        }
        Ok(())
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// An envelope and the neighbors it should be sent to. The node runtime
/// does the sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPlan {
    pub envelope: GossipEnvelope,
    pub targets: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Already seen. Nothing ran, nothing to relay.
    Duplicate,
    Rejected(GossipError),
    /// New and processed. `relay` is `None` when the hop budget is spent or
    /// no eligible neighbor is left.
    Accepted { relay: Option<RelayPlan> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub relayed: u64,
    pub originated: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    relayed: AtomicU64,
    originated: AtomicU64,
}

/// Topic handler. Runs to completion on the caller's task and must not block.
pub type Handler = Box<dyn Fn(&GossipEnvelope) + Send + Sync>;

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// The gossip engine.
///
/// Does no network I/O. It decides what is new and where it goes next, and
/// returns a [`RelayPlan`] that the node runtime sends.
pub struct Gossip {
    config: GossipConfig,
    keypair: Arc<NodeKeypair>,
    local: PeerId,
    /// Envelope id -> first-seen time (unix ms).
    seen: DashMap<Hash32, u64>,
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
    counters: Counters,
}

impl Gossip {
    pub fn new(config: GossipConfig, keypair: Arc<NodeKeypair>) -> Self {
        let local = keypair.peer_id();
        Self {
            config,
            keypair,
            local,
            seen: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Register a handler for `topic`. Handlers for the same topic run in
    /// registration order.
    pub fn subscribe(&self, topic: Topic, handler: impl Fn(&GossipEnvelope) + Send + Sync + 'static) {
        self.handlers
            .write()
            .entry(topic)
            .or_default()
            .push(Box::new(handler));
    }

    /// Originate `event`, mark it seen and plan the first hop.
    pub fn broadcast(&self, event: GossipEvent, neighbors: &[PeerId], now: u64) -> Result<RelayPlan, GossipError> {
        let envelope = GossipEnvelope::originate(&self.keypair, event, self.config.max_hops)?;
        self.seen.insert(envelope.id, now);
        self.maybe_evict_seen(now);
        self.counters.originated.fetch_add(1, Ordering::Relaxed);

        let targets = self.pick_targets(&envelope, None, neighbors);
        if targets.is_empty() {
            debug!(topic = ?envelope.topic(), "no neighbors, event stays local");
        }
        Ok(RelayPlan { envelope, targets })
    }

    /// Process an envelope received from neighbor `from`.
    pub fn handle_incoming(
        &self,
        from: &PeerId,
        envelope: GossipEnvelope,
        neighbors: &[PeerId],
        now: u64,
    ) -> GossipOutcome {
        if &envelope.sender != from {
            return self.reject(GossipError::SenderMismatch {
                claimed: envelope.sender.clone(),
                actual: from.clone(),
            });
        }
        if let Err(err) = envelope.verify(self.config.max_hops) {
            return self.reject(err);
        }

        match self.seen.entry(envelope.id) {
            Entry::Occupied(_) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                trace!(from = %from.short(), id = %short_hex(&envelope.id), "duplicate gossip dropped");
                return GossipOutcome::Duplicate;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }
        self.maybe_evict_seen(now);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(handlers) = self.handlers.read().get(&envelope.topic()) {
            for handler in handlers {
                handler(&envelope);
            }
        }

        let relay = envelope
            .forwarded(&self.local, self.config.max_hops)
            .and_then(|next| {
                let targets = self.pick_targets(&next, Some(from), neighbors);
                (!targets.is_empty()).then_some(RelayPlan {
                    envelope: next,
                    targets,
                })
            });
        if let Some(plan) = &relay {
            self.counters.relayed.fetch_add(1, Ordering::Relaxed);
            trace!(
                id = %short_hex(&plan.envelope.id),
                hops_remaining = plan.envelope.hops_remaining,
                targets = plan.targets.len(),
                "relaying gossip"
            );
        }
        GossipOutcome::Accepted { relay }
    }

    fn reject(&self, err: GossipError) -> GossipOutcome {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(error = %err, "gossip envelope discarded");
        GossipOutcome::Rejected(err)
    }

    /// Up to `fanout` random neighbors that are not the sender and not
    /// already on the route.
    fn pick_targets(&self, envelope: &GossipEnvelope, from: Option<&PeerId>, neighbors: &[PeerId]) -> Vec<PeerId> {
        let eligible: Vec<&PeerId> = neighbors
            .iter()
            .filter(|peer| **peer != self.local)
            .filter(|peer| Some(*peer) != from)
            .filter(|peer| !envelope.route.contains(*peer))
            .collect();
        eligible
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .map(|peer| (*peer).clone())
            .collect()
    }

    pub fn has_seen(&self, id: &Hash32) -> bool {
        self.seen.contains_key(id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Drop ids past their retention, then enforce the size bound.
    pub fn prune(&self, now: u64) {
        let retention = self.config.seen_retention_ms;
        self.seen.retain(|_, first_seen| now.saturating_sub(*first_seen) < retention);
        self.maybe_evict_seen(now);
    }

    /// Evicts the oldest entries once the seen-set exceeds capacity.
    fn maybe_evict_seen(&self, now: u64) {
        if self.seen.len() <= self.config.seen_capacity {
            return;
        }

        // Remove oldest entries until we're at 75% capacity, sparing
        // anything still inside the propagation window.
        let target = self.config.seen_capacity * 3 / 4;
        let mut entries: Vec<(Hash32, u64)> = self
            .seen
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);

        let to_remove = entries.len().saturating_sub(target);
        let window = self.config.propagation_window_ms;
        for (id, _) in entries
            .iter()
            .take(to_remove)
            .filter(|(_, ts)| now.saturating_sub(*ts) >= window)
        {
            self.seen.remove(id);
        }
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            originated: self.counters.originated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn make_config() -> GossipConfig {
        GossipConfig {
            seen_capacity: 100,
            ..GossipConfig::default()
        }
    }

    fn node(seed: u8) -> (Arc<NodeKeypair>, Gossip) {
        let kp = Arc::new(NodeKeypair::from_seed(&[seed; 32]));
        let gossip = Gossip::new(make_config(), Arc::clone(&kp));
        (kp, gossip)
    }

    fn left(peer: PeerId) -> GossipEvent {
        GossipEvent::PeerLeft { peer }
    }

    fn counter(gossip: &Gossip, topic: Topic) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        gossip.subscribe(topic, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        calls
    }

    #[test]
    fn duplicate_envelopes_run_handlers_once() {
        let (origin, _) = node(1);
        let (_, gossip) = node(2);
        let calls = counter(&gossip, Topic::PeerLeft);
        let envelope = GossipEnvelope::originate(&origin, left(origin.peer_id()), 6).unwrap();
        let from = origin.peer_id();
        let neighbors = vec![from.clone(), node(3).0.peer_id()];

        let first = gossip.handle_incoming(&from, envelope.clone(), &neighbors, 1_000);
        assert!(matches!(first, GossipOutcome::Accepted { relay: Some(_) }));
        assert_eq!(gossip.handle_incoming(&from, envelope, &neighbors, 1_001), GossipOutcome::Duplicate);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gossip.stats().duplicates, 1);
    }

    #[test]
    fn relay_excludes_sender_and_route() {
        let (origin, _) = node(1);
        let (local_kp, gossip) = node(2);
        let (relay_kp, _) = node(3);
        let fresh = node(4).0.peer_id();

        let envelope = GossipEnvelope::originate(&origin, left(fresh.clone()), 6).unwrap();
        let hop = envelope.forwarded(&relay_kp.peer_id(), 6).unwrap();
        let neighbors = vec![origin.peer_id(), relay_kp.peer_id(), fresh.clone()];

        let GossipOutcome::Accepted { relay: Some(plan) } =
            gossip.handle_incoming(&relay_kp.peer_id(), hop, &neighbors, 0)
        else {
            panic!("expected a relay");
        };
        assert_eq!(plan.targets, vec![fresh]);
        assert_eq!(plan.envelope.hops_remaining, 4);
        assert_eq!(plan.envelope.sender, local_kp.peer_id());
        assert_eq!(
            plan.envelope.route,
            vec![origin.peer_id(), relay_kp.peer_id(), local_kp.peer_id()]
        );
    }

    #[test]
    fn exhausted_budget_is_processed_but_not_relayed() {
        let (origin, _) = node(1);
        let (_, gossip) = node(2);
        let calls = counter(&gossip, Topic::PeerLeft);
        let envelope = GossipEnvelope::originate(&origin, left(origin.peer_id()), 0).unwrap();
        let neighbors = vec![node(3).0.peer_id()];

        let outcome = gossip.handle_incoming(&origin.peer_id(), envelope, &neighbors, 0);
        assert_eq!(outcome, GossipOutcome::Accepted { relay: None });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inflated_hop_count_is_clamped() {
        let (origin, _) = node(1);
        let (_, gossip) = node(2);
        let mut envelope = GossipEnvelope::originate(&origin, left(origin.peer_id()), 6).unwrap();
        envelope.hops_remaining = 200;
        let neighbors = vec![node(3).0.peer_id()];

        let GossipOutcome::Accepted { relay: Some(plan) } =
            gossip.handle_incoming(&origin.peer_id(), envelope, &neighbors, 0)
        else {
            panic!("expected a relay");
        };
        assert_eq!(plan.envelope.hops_remaining, GOSSIP_MAX_HOPS - 1);
    }

    #[test]
    fn forged_and_malformed_envelopes_are_rejected() {
        let (origin, _) = node(1);
        let (impostor, _) = node(9);
        let (_, gossip) = node(2);
        let calls = counter(&gossip, Topic::PeerLeft);
        let from = origin.peer_id();

        let mut forged = GossipEnvelope::originate(&origin, left(from.clone()), 6).unwrap();
        forged.signature = impostor.sign(b"something else");
        assert!(matches!(
            gossip.handle_incoming(&from, forged, &[], 0),
            GossipOutcome::Rejected(GossipError::BadSignature(_))
        ));

        let mut swapped = GossipEnvelope::originate(&origin, left(from.clone()), 6).unwrap();
        swapped.event = left(impostor.peer_id());
        assert_eq!(
            gossip.handle_incoming(&from, swapped, &[], 0),
            GossipOutcome::Rejected(GossipError::IdMismatch)
        );

        let mut long = GossipEnvelope::originate(&origin, left(from.clone()), 6).unwrap();
        long.route = vec![from.clone(); 8];
        assert!(matches!(
            gossip.handle_incoming(&from, long, &[], 0),
            GossipOutcome::Rejected(GossipError::RouteTooLong { len: 8, max: 7 })
        ));

        let honest = GossipEnvelope::originate(&origin, left(from.clone()), 6).unwrap();
        assert!(matches!(
            gossip.handle_incoming(&impostor.peer_id(), honest.clone(), &[], 0),
            GossipOutcome::Rejected(GossipError::SenderMismatch { .. })
        ));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // A rejected copy does not poison the seen-set for the genuine one.
        assert!(!gossip.has_seen(&honest.id));
    }

    #[test]
    fn broadcast_marks_seen_and_plans_fanout() {
        let (_, gossip) = node(1);
        let neighbors: Vec<PeerId> = (10..20).map(|seed| node(seed).0.peer_id()).collect();

        let plan = gossip
            .broadcast(left(neighbors[0].clone()), &neighbors, 0)
            .unwrap();
        assert_eq!(plan.targets.len(), GOSSIP_FANOUT);
        assert!(gossip.has_seen(&plan.envelope.id));
        assert_eq!(plan.envelope.route.len(), 1);
        plan.envelope.verify(GOSSIP_MAX_HOPS).unwrap();
    }

    #[test]
    fn seen_eviction_spares_recent_ids() {
        let (_, gossip) = node(2);
        let window = gossip.config().propagation_window_ms;

        // 100 old entries, then 30 fresh ones push the set over capacity.
        for i in 0..130u32 {
            let mut seed = [7u8; 32];
            seed[..4].copy_from_slice(&i.to_be_bytes());
            let origin = NodeKeypair::from_seed(&seed);
            let envelope = GossipEnvelope::originate(&origin, left(origin.peer_id()), 6).unwrap();
            let ts = if i < 100 { 0 } else { window * 2 };
            gossip.handle_incoming(&origin.peer_id(), envelope, &[], ts);
        }

        assert!(gossip.seen_count() <= 100);
        assert!(gossip.seen_count() >= 30);

        gossip.prune(window * 2 + gossip.config().seen_retention_ms);
        assert_eq!(gossip.seen_count(), 0);
    }

    #[test]
    fn flood_reaches_everyone_once_within_hop_budget() {
        // Ring of 12 nodes with chords: plenty of cycles.
        let nodes: Vec<(Arc<NodeKeypair>, Gossip)> = (1..=12).map(node).collect();
        let ids: Vec<PeerId> = nodes.iter().map(|(kp, _)| kp.peer_id()).collect();
        let neighbors_of = |i: usize| -> Vec<PeerId> {
            [1, 3, 11, 9]
                .iter()
                .map(|step| ids[(i + step) % ids.len()].clone())
                .collect()
        };
        let calls: Vec<Arc<AtomicUsize>> = nodes.iter().map(|(_, g)| counter(g, Topic::PeerLeft)).collect();

        let plan = nodes[0].1.broadcast(left(ids[5].clone()), &neighbors_of(0), 0).unwrap();
        let mut queue: VecDeque<(usize, GossipEnvelope)> = plan
            .targets
            .iter()
            .map(|t| (ids.iter().position(|id| id == t).unwrap(), plan.envelope.clone()))
            .collect();

        let mut deliveries = 0;
        while let Some((at, envelope)) = queue.pop_front() {
            deliveries += 1;
            assert!(envelope.route.len() <= GOSSIP_MAX_HOPS as usize + 1);
            let from = envelope.sender.clone();
            if let GossipOutcome::Accepted { relay: Some(next) } =
                nodes[at].1.handle_incoming(&from, envelope, &neighbors_of(at), 0)
            {
                for target in &next.targets {
                    let idx = ids.iter().position(|id| id == target).unwrap();
                    queue.push_back((idx, next.envelope.clone()));
                }
            }
        }

        assert!(deliveries > 0);
        for (i, calls) in calls.iter().enumerate().skip(1) {
            assert_eq!(calls.load(Ordering::SeqCst), 1, "node {i} handled the event");
        }
        // The originator never handles its own broadcast.
        assert_eq!(calls[0].load(Ordering::SeqCst), 0);
    }
}
