//! # Transport
//!
//! The byte pipe underneath the node. A transport knows how to reach a
//! peer and move opaque frames; it knows nothing about handshakes,
//! encryption or messages. Those live in [`super::link`] and
//! [`super::messager`].
//!
//! Incoming traffic is delivered as [`TransportEvent`]s on the mpsc
//! receiver handed out when the transport is created, so the node event loop
//! can `select!` over it next to everything else.
//!
//! [`MemoryNetwork`] is an in-process implementation: every endpoint
//! registers with a shared hub and frames are passed along channels. It is
//! what the integration tests and local simulations run on. The node binary
//! ships a TCP implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::crypto::keys::PeerId;

/// Capacity of each endpoint's event queue.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection is up. `outbound` is true when we dialed.
    Connected { peer: PeerId, outbound: bool },
    Disconnected { peer: PeerId },
    Message { peer: PeerId, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("no connection to peer {0}")]
    NotConnected(PeerId),

    #[error("transport closed")]
    Closed,

    #[error("transport I/O: {0}")]
    Io(String),
}

/// A way to reach peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection. `address` is a hint from the peer store; a
    /// transport may ignore it if it can resolve the id on its own.
    async fn connect(&self, peer: &PeerId, address: Option<&str>) -> Result<(), TransportError>;

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close a connection. Closing an unknown connection is a no-op.
    async fn disconnect(&self, peer: &PeerId);
}

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

/// In-process hub connecting [`MemoryTransport`] endpoints.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    inner: Mutex<Hub>,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    links: HashSet<(PeerId, PeerId)>,
    /// Endpoints that refuse inbound connections (unreachable NAT'd peers).
    unreachable: HashSet<PeerId>,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint for `peer`.
    pub fn endpoint(self: &Arc<Self>, peer: PeerId) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.inner.lock().endpoints.insert(peer.clone(), tx);
        (
            MemoryTransport {
                local: peer,
                network: Arc::clone(self),
            },
            rx,
        )
    }

    /// Make `peer` refuse inbound connections.
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut hub = self.inner.lock();
        if unreachable {
            hub.unreachable.insert(peer.clone());
        } else {
            hub.unreachable.remove(peer);
        }
    }

    /// Take `peer` off the network, closing all of its links.
    pub fn remove(&self, peer: &PeerId) {
        let notify = {
            let mut hub = self.inner.lock();
            hub.endpoints.remove(peer);
            let dropped: Vec<(PeerId, PeerId)> = hub
                .links
                .iter()
                .filter(|(a, b)| a == peer || b == peer)
                .cloned()
                .collect();
            let mut notify = Vec::new();
            for key in dropped {
                hub.links.remove(&key);
                let other = if &key.0 == peer { key.1 } else { key.0 };
                if let Some(tx) = hub.endpoints.get(&other) {
                    notify.push(tx.clone());
                }
            }
            notify
        };
        for tx in notify {
            let _ = tx.try_send(TransportEvent::Disconnected { peer: peer.clone() });
        }
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.inner.lock().links.contains(&link_key(a, b))
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: &PeerId, _address: Option<&str>) -> Result<(), TransportError> {
        let (ours, theirs) = {
            let mut hub = self.network.inner.lock();
            if peer == &self.local || hub.unreachable.contains(peer) {
                return Err(TransportError::Unreachable(peer.clone()));
            }
            let (Some(ours), Some(theirs)) =
                (hub.endpoints.get(&self.local), hub.endpoints.get(peer))
            else {
                return Err(TransportError::Unreachable(peer.clone()));
            };
            let (ours, theirs) = (ours.clone(), theirs.clone());
            if !hub.links.insert(link_key(&self.local, peer)) {
                // Already linked, possibly by the other side dialing first.
                return Ok(());
            }
            (ours, theirs)
        };

        debug!(local = %self.local.short(), peer = %peer.short(), "memory link up");
        ours.send(TransportEvent::Connected {
            peer: peer.clone(),
            outbound: true,
        })
        .await
        .map_err(|_| TransportError::Closed)?;
        theirs
            .send(TransportEvent::Connected {
                peer: self.local.clone(),
                outbound: false,
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let target = {
            let hub = self.network.inner.lock();
            if !hub.links.contains(&link_key(&self.local, peer)) {
                return Err(TransportError::NotConnected(peer.clone()));
            }
            hub.endpoints
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::NotConnected(peer.clone()))?
        };
        trace!(local = %self.local.short(), peer = %peer.short(), len = bytes.len(), "memory frame");
        target
            .send(TransportEvent::Message {
                peer: self.local.clone(),
                bytes,
            })
            .await
            .map_err(|_| TransportError::NotConnected(peer.clone()))
    }

    async fn disconnect(&self, peer: &PeerId) {
        let senders = {
            let mut hub = self.network.inner.lock();
            if !hub.links.remove(&link_key(&self.local, peer)) {
                return;
            }
            (
                hub.endpoints.get(&self.local).cloned(),
                hub.endpoints.get(peer).cloned(),
            )
        };
        if let Some(ours) = senders.0 {
            let _ = ours
                .send(TransportEvent::Disconnected { peer: peer.clone() })
                .await;
        }
        if let Some(theirs) = senders.1 {
            let _ = theirs
                .send(TransportEvent::Disconnected {
                    peer: self.local.clone(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_store::tests::peer;

    #[tokio::test]
    async fn connect_notifies_both_sides() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.endpoint(peer(1));
        let (_b, mut b_rx) = net.endpoint(peer(2));

        a.connect(&peer(2), None).await.unwrap();
        assert_eq!(
            a_rx.recv().await,
            Some(TransportEvent::Connected {
                peer: peer(2),
                outbound: true
            })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Connected {
                peer: peer(1),
                outbound: false
            })
        );
        assert!(net.is_linked(&peer(1), &peer(2)));
    }

    #[tokio::test]
    async fn send_requires_link() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.endpoint(peer(1));
        let (_b, mut b_rx) = net.endpoint(peer(2));

        assert_eq!(
            a.send(&peer(2), vec![1]).await,
            Err(TransportError::NotConnected(peer(2)))
        );
        a.connect(&peer(2), None).await.unwrap();
        let _ = b_rx.recv().await;
        a.send(&peer(2), vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Message {
                peer: peer(1),
                bytes: vec![1, 2, 3]
            })
        );
    }

    #[tokio::test]
    async fn unreachable_and_unknown_peers_fail() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.endpoint(peer(1));
        let (_b, _b_rx) = net.endpoint(peer(2));
        net.set_unreachable(&peer(2), true);

        assert!(a.connect(&peer(2), None).await.is_err());
        assert!(a.connect(&peer(3), None).await.is_err());
        assert!(a.connect(&peer(1), None).await.is_err());
    }

    #[tokio::test]
    async fn remove_disconnects_links() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.endpoint(peer(1));
        let (_b, _b_rx) = net.endpoint(peer(2));
        a.connect(&peer(2), None).await.unwrap();
        let _ = a_rx.recv().await;

        net.remove(&peer(2));
        assert_eq!(
            a_rx.recv().await,
            Some(TransportEvent::Disconnected { peer: peer(2) })
        );
        assert_eq!(net.link_count(), 0);
    }
}
