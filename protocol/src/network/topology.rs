//! # Topologist
//!
//! Decides which peers to dial and which connections to drop so the node
//! converges on `target_neighbors` live connections.
//!
//! `plan` is pure: it reads the [`PeerStore`] and returns
//! [`TopologyAction`]s. The node event loop executes them, calling
//! `begin_dial` before every dial so a plan can never start a second dial to
//! a peer that already has one in flight.
//!
//! ## Selection rules
//!
//! - **Under target:** dial known peers that are not backing off, ranked
//!   public first, then not attempted within `recent_attempt_window`, then a
//!   random tie-break.
//! - **Over target:** drop the connection whose neighbors we would miss the
//!   least. A peer's utility is the number of its neighbors not already
//!   covered by us or by our other connections. Ties go to the most recently
//!   connected peer.
//! - **Silence:** connected peers not heard from within `peer_ttl` are
//!   dropped regardless of the count.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::peer_store::{PeerRecord, PeerStatus, PeerStore};
use crate::crypto::keys::PeerId;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Topology and dial policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub target_neighbors: usize,
    pub dial_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_dial_failures: u32,
    pub peer_ttl_ms: u64,
    pub recent_attempt_window_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            target_neighbors: crate::config::TARGET_NEIGHBORS,
            dial_timeout_ms: crate::config::DIAL_TIMEOUT.as_millis() as u64,
            backoff_base_ms: crate::config::DIAL_BACKOFF_BASE.as_millis() as u64,
            backoff_max_ms: crate::config::DIAL_BACKOFF_MAX.as_millis() as u64,
            max_dial_failures: crate::config::MAX_DIAL_FAILURES,
            peer_ttl_ms: crate::config::PEER_TTL.as_millis() as u64,
            recent_attempt_window_ms: crate::config::RECENT_ATTEMPT_WINDOW.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Silent,
    OverTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyAction {
    Dial(PeerId),
    Drop { peer: PeerId, reason: DropReason },
}

// ---------------------------------------------------------------------------
// Topologist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Topologist {
    config: TopologyConfig,
}

impl Topologist {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn plan<R: Rng + ?Sized>(&self, store: &PeerStore, now: u64, rng: &mut R) -> Vec<TopologyAction> {
        let mut actions = Vec::new();

        let (silent, mut live): (Vec<&PeerRecord>, Vec<&PeerRecord>) = store
            .records()
            .filter(|r| r.status == PeerStatus::Connected)
            .partition(|r| now.saturating_sub(r.last_seen) > self.config.peer_ttl_ms);
        for record in silent {
            actions.push(TopologyAction::Drop {
                peer: record.id.clone(),
                reason: DropReason::Silent,
            });
        }

        let connecting = store
            .records()
            .filter(|r| r.status == PeerStatus::Connecting)
            .count();
        let target = self.config.target_neighbors;

        if live.len() + connecting < target {
            let wanted = target - live.len() - connecting;
            for id in self.dial_candidates(store, now, rng).into_iter().take(wanted) {
                actions.push(TopologyAction::Dial(id));
            }
        } else if live.len() > target {
            let excess = live.len() - target;
            for _ in 0..excess {
                let Some(pos) = lowest_utility(store.local_id(), &live) else {
                    break;
                };
                let dropped = live.swap_remove(pos);
                actions.push(TopologyAction::Drop {
                    peer: dropped.id.clone(),
                    reason: DropReason::OverTarget,
                });
            }
        }

        actions
    }

    /// Known peers eligible for a dial, best first.
    fn dial_candidates<R: Rng + ?Sized>(&self, store: &PeerStore, now: u64, rng: &mut R) -> Vec<PeerId> {
        let window = self.config.recent_attempt_window_ms;
        let mut ranked: Vec<((bool, bool, u64), PeerId)> = store
            .records()
            .filter(|r| r.status == PeerStatus::Known && !r.is_backing_off(now))
            .map(|r| {
                let recently_tried = r
                    .last_attempt
                    .is_some_and(|at| now.saturating_sub(at) < window);
                ((!r.is_public, recently_tried, rng.gen::<u64>()), r.id.clone())
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        ranked.into_iter().map(|(_, id)| id).collect()
    }
}

/// Index of the live peer whose neighbors are least covered elsewhere.
fn lowest_utility(local: &PeerId, live: &[&PeerRecord]) -> Option<usize> {
    live.iter()
        .enumerate()
        .map(|(pos, candidate)| {
            let mut covered: BTreeSet<&PeerId> = live.iter().map(|r| &r.id).collect();
            covered.insert(local);
            for other in live.iter().filter(|r| r.id != candidate.id) {
                covered.extend(other.neighbors.iter());
            }
            let utility = candidate
                .neighbors
                .iter()
                .filter(|n| !covered.contains(n))
                .count();
            (pos, utility, candidate.connected_since.unwrap_or(0))
        })
        .min_by_key(|(_, utility, since)| (*utility, Reverse(*since)))
        .map(|(pos, _, _)| pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_store::tests::{announce, peer};
    use crate::network::peer_store::{DialOutcome, PeerAnnouncement};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(target: usize) -> (PeerStore, Topologist, StdRng) {
        let config = TopologyConfig {
            target_neighbors: target,
            ..TopologyConfig::default()
        };
        (
            PeerStore::new(peer(0)),
            Topologist::new(config),
            StdRng::seed_from_u64(7),
        )
    }

    fn dials(actions: &[TopologyAction]) -> Vec<PeerId> {
        actions
            .iter()
            .filter_map(|a| match a {
                TopologyAction::Dial(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn connect(store: &mut PeerStore, id: &PeerId, now: u64) {
        store.begin_dial(id, now, 10_000).unwrap();
        store.dial_succeeded(id, now);
    }

    // -- 1. under target -------------------------------------------------

    #[test]
    fn dials_up_to_target_preferring_public() {
        let (mut store, topo, mut rng) = setup(2);
        store.learn(&announce(&peer(1), false), 0);
        store.learn(&announce(&peer(2), true), 0);
        store.learn(&announce(&peer(3), false), 0);

        let planned = dials(&topo.plan(&store, 0, &mut rng));
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0], peer(2));
    }

    #[test]
    fn recently_attempted_peers_rank_last() {
        let (mut store, topo, mut rng) = setup(1);
        store.learn(&announce(&peer(1), false), 0);
        store.learn(&announce(&peer(2), false), 0);
        store.begin_dial(&peer(1), 0, 10).unwrap();
        store.disconnected(&peer(1), 1);

        let planned = dials(&topo.plan(&store, 5, &mut rng));
        assert_eq!(planned, vec![peer(2)]);
    }

    #[test]
    fn in_flight_dials_count_toward_target() {
        let (mut store, topo, mut rng) = setup(2);
        for seed in 1..=4 {
            store.learn(&announce(&peer(seed), false), 0);
        }
        store.begin_dial(&peer(1), 0, 10_000).unwrap();
        connect(&mut store, &peer(2), 0);
        assert!(dials(&topo.plan(&store, 1, &mut rng)).is_empty());
    }

    #[test]
    fn backing_off_peers_are_skipped() {
        let (mut store, topo, mut rng) = setup(3);
        store.learn(&announce(&peer(1), false), 0);
        store.begin_dial(&peer(1), 0, 10).unwrap();
        store.dial_failed(&peer(1), 0, topo.config());
        assert!(dials(&topo.plan(&store, 1, &mut rng)).is_empty());
    }

    // -- 2. over target ---------------------------------------------------

    #[test]
    fn drops_lowest_utility_when_over_target() {
        let (mut store, topo, mut rng) = setup(2);
        // peer 1 brings unique neighbors 10 and 11; peer 2 brings 12; peer 3
        // only knows peers we already reach.
        let neighbors = [
            (1, vec![peer(10), peer(11)]),
            (2, vec![peer(12)]),
            (3, vec![peer(1), peer(2)]),
        ];
        for (seed, ns) in neighbors {
            store.learn(
                &PeerAnnouncement {
                    neighbors: ns,
                    ..announce(&peer(seed), false)
                },
                0,
            );
            connect(&mut store, &peer(seed), 0);
        }

        let actions = topo.plan(&store, 1, &mut rng);
        assert_eq!(
            actions,
            vec![TopologyAction::Drop {
                peer: peer(3),
                reason: DropReason::OverTarget
            }]
        );
    }

    #[test]
    fn utility_tie_drops_most_recent_connection() {
        let (mut store, topo, mut rng) = setup(1);
        store.learn(&announce(&peer(1), false), 0);
        store.learn(&announce(&peer(2), false), 0);
        connect(&mut store, &peer(1), 10);
        connect(&mut store, &peer(2), 20);

        let actions = topo.plan(&store, 21, &mut rng);
        assert_eq!(
            actions,
            vec![TopologyAction::Drop {
                peer: peer(2),
                reason: DropReason::OverTarget
            }]
        );
    }

    #[test]
    fn silent_peers_are_dropped() {
        let (mut store, topo, mut rng) = setup(5);
        store.learn(&announce(&peer(1), false), 0);
        connect(&mut store, &peer(1), 0);
        let late = topo.config().peer_ttl_ms + 1;
        let actions = topo.plan(&store, late, &mut rng);
        assert!(actions.contains(&TopologyAction::Drop {
            peer: peer(1),
            reason: DropReason::Silent
        }));
    }

    // -- 3. convergence ---------------------------------------------------

    /// Simulated churn: dials fail a third of the time and connections drop
    /// at random. Once churn stops, a handful of rounds must settle on
    /// exactly `target` connections.
    #[test]
    fn converges_to_target_under_churn() {
        let (mut store, topo, mut rng) = setup(5);
        for seed in 1..=30u8 {
            store.learn(&announce(&peer(seed), seed % 3 == 0), 0);
        }

        let mut now = 0u64;
        let step = 2_000;
        let run_round = |store: &mut PeerStore, rng: &mut StdRng, now: u64, churn: bool| {
            for action in topo.plan(store, now, rng) {
                match action {
                    TopologyAction::Dial(id) => {
                        if store.begin_dial(&id, now, 1_000).is_err() {
                            continue;
                        }
                        if churn && rng.gen_ratio(1, 3) {
                            let _: DialOutcome = store.dial_failed(&id, now, topo.config());
                        } else {
                            store.dial_succeeded(&id, now);
                        }
                    }
                    TopologyAction::Drop { peer, .. } => store.disconnected(&peer, now),
                }
            }
            for id in store.connected() {
                store.touch(&id, now);
                if churn && rng.gen_ratio(1, 10) {
                    store.disconnected(&id, now);
                }
            }
        };

        for _ in 0..50 {
            now += step;
            run_round(&mut store, &mut rng, now, true);
            assert!(store.connected().len() <= 5);
        }
        for _ in 0..40 {
            now += step;
            run_round(&mut store, &mut rng, now, false);
        }
        assert_eq!(store.connected().len(), 5);
    }
}
