//! # Peer Store
//!
//! The node's view of every peer it has heard of, and the dial state
//! machine for each of them:
//!
//! ```text
//!   learn            begin_dial         dial_succeeded
//!  ───────► Known ─────────────► Connecting ─────────────► Connected
//!             ▲                     │                        │
//!             │   dial_failed       │                        │ disconnected
//!             ├─────────────────────┘                        │
//!             └──────────────────────────────────────────────┘
//!   (evicted after `max_dial_failures`, forgotten after `peer_ttl`)
//! ```
//!
//! ## Design Decisions
//!
//! - **Single owner.** The store is plain data owned by the node event loop.
//!   There is no interior locking; two dials to the same peer cannot
//!   overlap because `begin_dial` refuses while one is in flight.
//! - **Explicit clock.** Every method takes `now` in unix milliseconds so
//!   backoff and expiry are testable without sleeping.
//! - **Addresses are hints.** A `PeerRecord` keeps the last address a peer
//!   advertised, but identity is always the `PeerId`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::topology::TopologyConfig;
use crate::crypto::keys::PeerId;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Known,
    Connecting,
    Connected,
}

/// What a peer says about itself, via handshake or `PeerJoined` gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: PeerId,
    pub is_public: bool,
    pub address: Option<String>,
    pub neighbors: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub status: PeerStatus,
    pub is_public: bool,
    pub neighbors: BTreeSet<PeerId>,
    /// Last time we heard from or about this peer (unix ms).
    pub last_seen: u64,
    pub address: Option<String>,
    /// Consecutive failed dials.
    pub failures: u32,
    /// No dial before this time (unix ms). Zero when not backing off.
    pub retry_at: u64,
    pub last_attempt: Option<u64>,
    /// When an in-flight dial counts as failed.
    pub dial_deadline: Option<u64>,
    pub connected_since: Option<u64>,
}

impl PeerRecord {
    fn new(id: PeerId, now: u64) -> Self {
        Self {
            id,
            status: PeerStatus::Known,
            is_public: false,
            neighbors: BTreeSet::new(),
            last_seen: now,
            address: None,
            failures: 0,
            retry_at: 0,
            last_attempt: None,
            dial_deadline: None,
            connected_since: None,
        }
    }

    pub fn is_backing_off(&self, now: u64) -> bool {
        self.retry_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error("peer {0} is not known")]
    Unknown(PeerId),

    #[error("a dial to {0} is already in progress or the peer is connected")]
    AlreadyInProgress(PeerId),

    #[error("peer {peer} is backing off until {retry_at}")]
    BackingOff { peer: PeerId, retry_at: u64 },
}

/// Result of recording a failed dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Retry { retry_at: u64 },
    Evicted,
}

/// Everything `expire` changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpiryReport {
    /// In-flight dials whose deadline passed, already recorded as failures.
    pub timed_out: Vec<(PeerId, DialOutcome)>,
    /// Known peers silent beyond the TTL, removed from the store.
    pub forgotten: Vec<PeerId>,
    /// Connected peers silent beyond the TTL. The caller drops them.
    pub silent: Vec<PeerId>,
}

/// Exponential backoff: `base * 2^(failures-1)`, capped at `max`.
pub fn backoff_delay(failures: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = failures.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exponent).min(max_ms)
}

#[derive(Debug, Clone)]
pub struct PeerStore {
    local: PeerId,
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerStore {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Insert or refresh a peer from an announcement. Returns `true` if the
    /// peer was not known before. Never downgrades a connected peer and
    /// never inserts ourselves.
    pub fn learn(&mut self, announcement: &PeerAnnouncement, now: u64) -> bool {
        if announcement.peer_id == self.local {
            return false;
        }
        let local = &self.local;
        let neighbors: BTreeSet<PeerId> = announcement
            .neighbors
            .iter()
            .filter(|n| *n != &announcement.peer_id)
            .cloned()
            .collect();

        let mut inserted = false;
        let record = self
            .peers
            .entry(announcement.peer_id.clone())
            .or_insert_with(|| {
                inserted = true;
                PeerRecord::new(announcement.peer_id.clone(), now)
            });
        record.is_public = announcement.is_public;
        if announcement.address.is_some() {
            record.address = announcement.address.clone();
        }
        record.neighbors = neighbors;
        record.last_seen = record.last_seen.max(now);

        if inserted {
            debug!(peer = %announcement.peer_id.short(), local = %local.short(), "learned new peer");
        }
        inserted
    }

    /// Move a known peer to `connecting`.
    pub fn begin_dial(&mut self, id: &PeerId, now: u64, timeout_ms: u64) -> Result<(), DialError> {
        let record = self
            .peers
            .get_mut(id)
            .ok_or_else(|| DialError::Unknown(id.clone()))?;
        match record.status {
            PeerStatus::Connecting | PeerStatus::Connected => {
                return Err(DialError::AlreadyInProgress(id.clone()))
            }
            PeerStatus::Known => {}
        }
        if record.is_backing_off(now) {
            return Err(DialError::BackingOff {
                peer: id.clone(),
                retry_at: record.retry_at,
            });
        }
        record.status = PeerStatus::Connecting;
        record.last_attempt = Some(now);
        record.dial_deadline = Some(now.saturating_add(timeout_ms));
        trace!(peer = %id.short(), "dial started");
        Ok(())
    }

    /// Mark a peer connected. Also used for inbound connections, in which
    /// case the peer may not have been known yet.
    pub fn dial_succeeded(&mut self, id: &PeerId, now: u64) {
        if id == &self.local {
            return;
        }
        let record = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone(), now));
        record.status = PeerStatus::Connected;
        record.failures = 0;
        record.retry_at = 0;
        record.dial_deadline = None;
        record.connected_since = Some(now);
        record.last_seen = now;
    }

    /// Record a failed dial and schedule the retry, or evict the peer after
    /// too many consecutive failures.
    pub fn dial_failed(&mut self, id: &PeerId, now: u64, policy: &TopologyConfig) -> DialOutcome {
        let Some(record) = self.peers.get_mut(id) else {
            return DialOutcome::Evicted;
        };
        record.failures += 1;
        if record.failures >= policy.max_dial_failures {
            self.peers.remove(id);
            debug!(peer = %id.short(), "peer evicted after repeated dial failures");
            return DialOutcome::Evicted;
        }
        let delay = backoff_delay(record.failures, policy.backoff_base_ms, policy.backoff_max_ms);
        record.status = PeerStatus::Known;
        record.dial_deadline = None;
        record.connected_since = None;
        record.retry_at = now.saturating_add(delay);
        trace!(peer = %id.short(), failures = record.failures, delay_ms = delay, "dial failed");
        DialOutcome::Retry {
            retry_at: record.retry_at,
        }
    }

    /// A live connection went away. The peer goes back to `known` with a
    /// clean failure count.
    pub fn disconnected(&mut self, id: &PeerId, now: u64) {
        if let Some(record) = self.peers.get_mut(id) {
            record.status = PeerStatus::Known;
            record.failures = 0;
            record.dial_deadline = None;
            record.connected_since = None;
            record.last_seen = record.last_seen.max(now);
        }
    }

    /// Time-driven transitions. See [`ExpiryReport`].
    pub fn expire(&mut self, now: u64, policy: &TopologyConfig) -> ExpiryReport {
        let mut report = ExpiryReport::default();

        let timed_out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| r.status == PeerStatus::Connecting)
            .filter(|r| r.dial_deadline.is_some_and(|deadline| deadline <= now))
            .map(|r| r.id.clone())
            .collect();
        for id in timed_out {
            let outcome = self.dial_failed(&id, now, policy);
            report.timed_out.push((id, outcome));
        }

        for record in self.peers.values() {
            if now.saturating_sub(record.last_seen) <= policy.peer_ttl_ms {
                continue;
            }
            match record.status {
                PeerStatus::Known => report.forgotten.push(record.id.clone()),
                PeerStatus::Connected => report.silent.push(record.id.clone()),
                PeerStatus::Connecting => {}
            }
        }
        for id in &report.forgotten {
            self.peers.remove(id);
        }

        report
    }

    pub fn update_neighbors(&mut self, id: &PeerId, neighbors: impl IntoIterator<Item = PeerId>, now: u64) {
        if let Some(record) = self.peers.get_mut(id) {
            record.neighbors = neighbors.into_iter().filter(|n| n != id).collect();
            record.last_seen = record.last_seen.max(now);
        }
    }

    /// We heard from `id`.
    pub fn touch(&mut self, id: &PeerId, now: u64) {
        if let Some(record) = self.peers.get_mut(id) {
            record.last_seen = record.last_seen.max(now);
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.peers.get(id).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.with_status(PeerStatus::Connected)
    }

    pub fn connecting(&self) -> Vec<PeerId> {
        self.with_status(PeerStatus::Connecting)
    }

    fn with_status(&self, status: PeerStatus) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Owned copy of every record, for snapshots and the control channel.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }
}
