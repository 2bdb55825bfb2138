//! # TCP Transport
//!
//! [`Transport`] over plain TCP. Frames are a big-endian `u32` length and
//! the payload, the same framing as the control channel.
//!
//! On a fresh connection each side first sends its peer id as a bare
//! frame. The hello is not trusted: the link handshake that follows is
//! signed with the peer's identity key and rejects a mismatch. It only
//! lets this layer key connections by peer id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_protocol::config::{DIAL_TIMEOUT, MAX_FRAME_SIZE};
use kestrel_protocol::control::{read_frame, write_frame};
use kestrel_protocol::crypto::PeerId;
use kestrel_protocol::network::transport::EVENT_QUEUE_DEPTH;
use kestrel_protocol::network::{Transport, TransportError, TransportEvent};

/// Outbound frames queued per connection before `send` waits.
const SEND_QUEUE_DEPTH: usize = 256;

struct Connection {
    id: u64,
    frames: mpsc::Sender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

struct Shared {
    local: PeerId,
    events: mpsc::Sender<TransportEvent>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept: Arc<JoinHandle<()>>,
}

impl TcpTransport {
    /// Listen on `addr` and start accepting peers.
    pub async fn bind(local: PeerId, addr: &str) -> std::io::Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            local,
            events,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });
        info!(address = %local_addr, "p2p listener bound");

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        Ok((
            Self {
                shared,
                local_addr,
                accept: Arc::new(accept),
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Stop accepting and drop every connection.
    pub fn close(&self) {
        self.accept.abort();
        let drained: Vec<Connection> = self.shared.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.shared.local)
            .field("address", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "p2p accept failed");
                continue;
            }
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            match tokio::time::timeout(DIAL_TIMEOUT, exchange_hello(stream, &shared.local)).await {
                Ok(Ok((peer, reader, writer))) => register(&shared, peer, reader, writer, false).await,
                Ok(Err(e)) => debug!(%remote, error = %e, "inbound hello failed"),
                Err(_) => debug!(%remote, "inbound hello timed out"),
            }
        });
    }
}

/// Swap peer ids. Returns the remote id and the split stream.
async fn exchange_hello(
    stream: TcpStream,
    local: &PeerId,
) -> Result<(PeerId, OwnedReadHalf, OwnedWriteHalf), TransportError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, local.as_str().as_bytes()).await.map_err(io)?;
    let hello = read_frame(&mut reader, MAX_FRAME_SIZE).await.map_err(io)?;
    let peer = std::str::from_utf8(&hello)
        .map_err(|e| TransportError::Io(format!("hello is not utf-8: {e}")))?
        .parse::<PeerId>()
        .map_err(|e| TransportError::Io(format!("bad hello: {e}")))?;
    Ok((peer, reader, writer))
}

fn io(e: impl std::fmt::Display) -> TransportError {
    TransportError::Io(e.to_string())
}

async fn register(shared: &Arc<Shared>, peer: PeerId, mut reader: OwnedReadHalf, writer: OwnedWriteHalf, outbound: bool) {
    if peer == shared.local {
        debug!("refusing connection to ourselves");
        return;
    }
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (frames, queue) = mpsc::channel(SEND_QUEUE_DEPTH);
    {
        let mut connections = shared.connections.lock();
        if connections.contains_key(&peer) {
            debug!(peer = %peer.short(), "duplicate connection dropped");
            return;
        }
        // The reader starts only after Connected is queued, so the node
        // never sees a message ahead of its connection.
        connections.insert(
            peer.clone(),
            Connection {
                id,
                frames,
                reader: None,
            },
        );
    }
    tokio::spawn(write_loop(writer, queue));

    if shared
        .events
        .send(TransportEvent::Connected {
            peer: peer.clone(),
            outbound,
        })
        .await
        .is_err()
    {
        return;
    }
    debug!(peer = %peer.short(), outbound, "tcp connection up");

    let task_shared = Arc::clone(shared);
    let task_peer = peer.clone();
    let handle = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, MAX_FRAME_SIZE).await {
                Ok(bytes) => {
                    let event = TransportEvent::Message {
                        peer: task_peer.clone(),
                        bytes,
                    };
                    if task_shared.events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(peer = %task_peer.short(), error = %e, "tcp connection closed");
                    break;
                }
            }
        }
        release(&task_shared, &task_peer, id).await;
    });

    let mut connections = shared.connections.lock();
    match connections.get_mut(&peer) {
        Some(connection) if connection.id == id => connection.reader = Some(handle),
        // Disconnected while we were announcing it.
        _ => handle.abort(),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "tcp write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Forget connection `id` to `peer` and report it, unless a newer
/// connection already replaced it.
async fn release(shared: &Shared, peer: &PeerId, id: u64) {
    let removed = {
        let mut connections = shared.connections.lock();
        match connections.get(peer) {
            Some(connection) if connection.id == id => connections.remove(peer),
            _ => None,
        }
    };
    if removed.is_some() {
        let _ = shared
            .events
            .send(TransportEvent::Disconnected { peer: peer.clone() })
            .await;
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer: &PeerId, address: Option<&str>) -> Result<(), TransportError> {
        if peer == &self.shared.local {
            return Err(TransportError::Unreachable(peer.clone()));
        }
        if self.shared.connections.lock().contains_key(peer) {
            return Ok(());
        }
        let address = address.ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let dial = async {
            let stream = TcpStream::connect(address).await.map_err(io)?;
            exchange_hello(stream, &self.shared.local).await
        };
        let (remote, reader, writer) = tokio::time::timeout(DIAL_TIMEOUT, dial)
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))??;
        if &remote != peer {
            warn!(expected = %peer.short(), got = %remote.short(), %address, "dialed the wrong peer");
            return Err(TransportError::Unreachable(peer.clone()));
        }
        register(&self.shared, remote, reader, writer, true).await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let frames = self
            .shared
            .connections
            .lock()
            .get(peer)
            .map(|c| c.frames.clone())
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;
        frames
            .send(bytes)
            .await
            .map_err(|_| TransportError::NotConnected(peer.clone()))
    }

    async fn disconnect(&self, peer: &PeerId) {
        let removed = self.shared.connections.lock().remove(peer);
        if let Some(connection) = removed {
            // Dropping the frame sender ends the write loop, which shuts
            // the socket down and lets the remote side see EOF.
            connection.close();
            let _ = self
                .shared
                .events
                .send(TransportEvent::Disconnected { peer: peer.clone() })
                .await;
        }
    }
}
