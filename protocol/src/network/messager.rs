//! # Messager
//!
//! Correlated request/response messaging over established [`Link`]
//! sessions. Gossip envelopes travel through the same sealed channel so a
//! peer connection carries exactly one framing.
//!
//! ## Exactly-once resolution
//!
//! A pending entry keyed by `(peer, correlation_id)` is registered before
//! the request leaves. Three things can resolve it: the reply handler, the
//! timeout and [`Messager::fail_peer`]. Each of them *removes* the entry
//! from the table, and only the one that actually got it out acts. The
//! losers find nothing and do nothing, which is what makes a reply landing
//! at 3100 ms after a 3000 ms timeout a silent no-op.
//!
//! The Messager never retries; callers own their retry policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::gossip::GossipEnvelope;
use super::link::{Link, ProtocolError};
use super::peer_store::PeerAnnouncement;
use super::sync::{SyncRequest, SyncResponse};
use super::transport::{Transport, TransportError};
use crate::config::REQUEST_TIMEOUT;
use crate::crypto::keys::PeerId;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagerConfig {
    /// Deadline for every request, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for MessagerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Sync(SyncRequest),
    /// Ask a peer for the peers it is connected to.
    GetNeighbors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Sync(SyncResponse),
    Neighbors(Vec<PeerAnnouncement>),
    /// The peer understood the request but could not serve it.
    Error(String),
}

/// Everything that travels inside a sealed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
    Gossip(GossipEnvelope),
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, MessagerError> {
        bincode::serialize(self).map_err(|e| MessagerError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessagerError> {
        bincode::deserialize(bytes).map_err(|e| MessagerError::Codec(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessagerError {
    #[error("request to {0} timed out")]
    Timeout(PeerId),

    #[error("peer {0} disconnected before replying")]
    PeerDisconnected(PeerId),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("peer replied with error: {0}")]
    Remote(String),

    #[error("envelope codec: {0}")]
    Codec(String),
}

type Resolver = oneshot::Sender<Result<Response, MessagerError>>;

// ---------------------------------------------------------------------------
// Messager
// ---------------------------------------------------------------------------

pub struct Messager {
    transport: Arc<dyn Transport>,
    link: Arc<Link>,
    config: MessagerConfig,
    next_id: AtomicU64,
    pending: DashMap<(PeerId, u64), Resolver>,
    late_replies: AtomicU64,
}

impl Messager {
    pub fn new(transport: Arc<dyn Transport>, link: Arc<Link>, config: MessagerConfig) -> Self {
        Self {
            transport,
            link,
            config,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            late_replies: AtomicU64::new(0),
        }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Send `body` to `peer` and wait for the correlated reply.
    pub async fn request(&self, peer: &PeerId, body: Request) -> Result<Response, MessagerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (peer.clone(), id);
        let (tx, mut rx) = oneshot::channel();
        let deadline = Instant::now() + self.timeout();
        self.pending.insert(key.clone(), tx);

        // A congested transport can hold the send; it shares the deadline.
        match tokio::time::timeout_at(deadline, self.transmit(peer, &Envelope::Request { id, body })).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.pending.remove(&key);
                return Err(err);
            }
            Err(_elapsed) => {
                self.pending.remove(&key);
                debug!(peer = %peer.short(), id, "request timed out while sending");
                return Err(MessagerError::Timeout(peer.clone()));
            }
        }

        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(received) => received,
            Err(_elapsed) => {
                if self.pending.remove(&key).is_some() {
                    debug!(peer = %peer.short(), id, "request timed out");
                    return Err(MessagerError::Timeout(peer.clone()));
                }
                // A resolver took the entry just before the deadline; its
                // value is already on the way.
                rx.await
            }
        };

        match outcome {
            Ok(Ok(Response::Error(message))) => Err(MessagerError::Remote(message)),
            Ok(result) => result,
            Err(_dropped) => Err(MessagerError::PeerDisconnected(peer.clone())),
        }
    }

    /// Resolve a pending request with its reply. Replies nobody waits for
    /// any more are dropped.
    pub fn on_response(&self, peer: &PeerId, id: u64, body: Response) {
        match self.pending.remove(&(peer.clone(), id)) {
            Some((_, resolver)) => {
                let _ = resolver.send(Ok(body));
            }
            None => {
                self.late_replies.fetch_add(1, Ordering::Relaxed);
                trace!(peer = %peer.short(), id, "late reply dropped");
            }
        }
    }

    /// Fail every request still waiting on `peer`.
    pub fn fail_peer(&self, peer: &PeerId) -> usize {
        let keys: Vec<(PeerId, u64)> = self
            .pending
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .map(|entry| entry.key().clone())
            .collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, resolver)) = self.pending.remove(&key) {
                let _ = resolver.send(Err(MessagerError::PeerDisconnected(peer.clone())));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(peer = %peer.short(), failed, "pending requests failed on disconnect");
        }
        failed
    }

    pub async fn respond(&self, peer: &PeerId, id: u64, body: Response) -> Result<(), MessagerError> {
        self.transmit(peer, &Envelope::Response { id, body }).await
    }

    pub async fn send_gossip(&self, peer: &PeerId, envelope: &GossipEnvelope) -> Result<(), MessagerError> {
        self.transmit(peer, &Envelope::Gossip(envelope.clone())).await
    }

    async fn transmit(&self, peer: &PeerId, envelope: &Envelope) -> Result<(), MessagerError> {
        let plaintext = envelope.encode()?;
        let frame = self.link.seal(peer, &plaintext)?;
        self.transport.send(peer, frame).await?;
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn late_replies(&self) -> u64 {
        self.late_replies.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::network::link::{Inbound, LocalInfo};
    use crate::network::transport::{MemoryNetwork, TransportEvent};
    use tokio::sync::mpsc;

    struct Side {
        id: PeerId,
        link: Arc<Link>,
        messager: Arc<Messager>,
        rx: mpsc::Receiver<TransportEvent>,
    }

    /// Two messagers with an established session and a memory link.
    async fn pair() -> (Side, Side) {
        let net = MemoryNetwork::new();
        let mut sides = Vec::new();
        for seed in [1u8, 2] {
            let kp = Arc::new(NodeKeypair::from_seed(&[seed; 32]));
            let id = kp.peer_id();
            let link = Arc::new(Link::new(kp));
            let (transport, rx) = net.endpoint(id.clone());
            let messager = Arc::new(Messager::new(
                Arc::new(transport),
                Arc::clone(&link),
                MessagerConfig::default(),
            ));
            sides.push(Side { id, link, messager, rx });
        }
        let mut b = sides.pop().unwrap();
        let mut a = sides.pop().unwrap();

        let local = LocalInfo::default();
        let hello = a.link.begin(&b.id, &local).unwrap();
        let Inbound::Established { reply: Some(reply), .. } = b.link.receive(&a.id, &hello, &local).unwrap() else {
            panic!("responder should reply");
        };
        a.link.receive(&b.id, &reply, &local).unwrap();

        a.messager.transport.connect(&b.id, None).await.unwrap();
        let _ = a.rx.recv().await;
        let _ = b.rx.recv().await;
        (a, b)
    }

    async fn next_envelope(side: &mut Side, from: &PeerId) -> Envelope {
        let Some(TransportEvent::Message { bytes, .. }) = side.rx.recv().await else {
            panic!("expected a message");
        };
        let Inbound::Payload(plain) = side.link.receive(from, &bytes, &LocalInfo::default()).unwrap() else {
            panic!("expected a payload");
        };
        Envelope::decode(&plain).unwrap()
    }

    #[tokio::test]
    async fn reply_resolves_request() {
        let (a, mut b) = pair().await;
        let requester = Arc::clone(&a.messager);
        let target = b.id.clone();
        let call = tokio::spawn(async move { requester.request(&target, Request::GetNeighbors).await });

        let Envelope::Request { id, body } = next_envelope(&mut b, &a.id).await else {
            panic!("expected a request");
        };
        assert_eq!(body, Request::GetNeighbors);
        b.messager.respond(&a.id, id, Response::Neighbors(vec![])).await.unwrap();

        let mut a = a;
        let Envelope::Response { id, body } = next_envelope(&mut a, &b.id).await else {
            panic!("expected a response");
        };
        a.messager.on_response(&b.id, id, body);

        assert_eq!(call.await.unwrap().unwrap(), Response::Neighbors(vec![]));
        assert_eq!(a.messager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_dropped() {
        let (a, mut b) = pair().await;
        let requester = Arc::clone(&a.messager);
        let target = b.id.clone();
        let call = tokio::spawn(async move { requester.request(&target, Request::GetNeighbors).await });

        let Envelope::Request { id, .. } = next_envelope(&mut b, &a.id).await else {
            panic!("expected a request");
        };

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let result = call.await.unwrap();
        assert!(matches!(result, Err(MessagerError::Timeout(ref p)) if *p == b.id));

        a.messager.on_response(&b.id, id, Response::Neighbors(vec![]));
        assert_eq!(a.messager.pending_count(), 0);
        assert_eq!(a.messager.late_replies(), 1);
    }

    /// Takes frames and never finishes sending them.
    struct Stalled;

    #[async_trait::async_trait]
    impl Transport for Stalled {
        async fn connect(&self, _peer: &PeerId, _address: Option<&str>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _peer: &PeerId, _bytes: Vec<u8>) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn disconnect(&self, _peer: &PeerId) {}
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_send_counts_against_the_timeout() {
        let a = Arc::new(NodeKeypair::from_seed(&[1; 32]));
        let b = Arc::new(NodeKeypair::from_seed(&[2; 32]));
        let (a_id, b_id) = (a.peer_id(), b.peer_id());
        let a_link = Arc::new(Link::new(a));
        let b_link = Link::new(b);
        let local = LocalInfo::default();
        let hello = a_link.begin(&b_id, &local).unwrap();
        let Inbound::Established { reply: Some(reply), .. } = b_link.receive(&a_id, &hello, &local).unwrap() else {
            panic!("responder should reply");
        };
        a_link.receive(&b_id, &reply, &local).unwrap();

        let messager = Messager::new(Arc::new(Stalled), a_link, MessagerConfig::default());
        let started = Instant::now();
        let result = messager.request(&b_id, Request::GetNeighbors).await;

        assert!(matches!(result, Err(MessagerError::Timeout(ref p)) if *p == b_id));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3_000) && waited < Duration::from_millis(3_100));
        assert_eq!(messager.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_peer_resolves_pending_with_disconnect() {
        let (a, mut b) = pair().await;
        let requester = Arc::clone(&a.messager);
        let target = b.id.clone();
        let call = tokio::spawn(async move { requester.request(&target, Request::GetNeighbors).await });
        let _ = next_envelope(&mut b, &a.id).await;

        assert_eq!(a.messager.fail_peer(&b.id), 1);
        assert!(matches!(call.await.unwrap(), Err(MessagerError::PeerDisconnected(_))));
        assert_eq!(a.messager.fail_peer(&b.id), 0);
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (a, mut b) = pair().await;
        let requester = Arc::clone(&a.messager);
        let target = b.id.clone();
        let call = tokio::spawn(async move { requester.request(&target, Request::GetNeighbors).await });
        let Envelope::Request { id, .. } = next_envelope(&mut b, &a.id).await else {
            panic!("expected a request");
        };

        a.messager.on_response(&b.id, id, Response::Error("busy".into()));
        assert!(matches!(call.await.unwrap(), Err(MessagerError::Remote(m)) if m == "busy"));
    }

    #[tokio::test]
    async fn request_without_session_fails_fast() {
        let net = MemoryNetwork::new();
        let kp = Arc::new(NodeKeypair::generate());
        let (transport, _rx) = net.endpoint(kp.peer_id());
        let messager = Messager::new(Arc::new(transport), Arc::new(Link::new(kp)), MessagerConfig::default());
        let stranger = NodeKeypair::generate().peer_id();

        let err = messager.request(&stranger, Request::GetNeighbors).await.unwrap_err();
        assert!(matches!(err, MessagerError::Protocol(ProtocolError::NoSession(_))));
        assert_eq!(messager.pending_count(), 0);
    }
}
