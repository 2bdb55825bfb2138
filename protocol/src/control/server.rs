//! TCP server side of the control channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::channel::{read_frame, write_frame, ControlChannel, Opened};
use super::{ControlConfig, ControlError, ControlReply, ControlRequest};
use crate::config::now_ms;
use crate::network::{NodeHandle, NodeQuery, QueryAnswer};

/// Occupancy of the single client slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Idle,
    Busy { peer: SocketAddr, since: u64 },
}

pub struct ControlServer {
    listener: TcpListener,
    config: ControlConfig,
    node: NodeHandle,
    slot: Arc<Mutex<Slot>>,
    resets: Arc<AtomicU64>,
}

impl ControlServer {
    pub async fn bind(config: ControlConfig, node: NodeHandle) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(&config.listen_address).await?;
        info!(address = %listener.local_addr()?, "control channel listening");
        Ok(Self {
            listener,
            config,
            node,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            resets: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn slot(&self) -> Slot {
        self.slot.lock().clone()
    }

    /// Channels reset after a protocol error or too many bad frames.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// A shared view of the reset counter, for callers that move the server
    /// into a task.
    pub fn reset_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.resets)
    }

    /// Accept clients until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControlError> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("control server stopping");
                        return Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.admit(stream, peer);
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        {
            let mut slot = self.slot.lock();
            if let Slot::Busy { peer: current, .. } = &*slot {
                warn!(%peer, %current, "control channel busy, connection refused");
                tokio::spawn(async move {
                    let _ = stream.shutdown().await;
                });
                return;
            }
            *slot = Slot::Busy { peer, since: now_ms() };
        }

        let node = self.node.clone();
        let config = self.config.clone();
        let slot = Arc::clone(&self.slot);
        let resets = Arc::clone(&self.resets);
        tokio::spawn(async move {
            debug!(%peer, "control client connected");
            match serve(stream, node, &config).await {
                Ok(()) => debug!(%peer, "control client left"),
                Err(err) => {
                    resets.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, error = %err, "control channel reset");
                }
            }
            *slot.lock() = Slot::Idle;
        });
    }
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("slot", &*self.slot.lock())
            .field("resets", &self.resets())
            .finish()
    }
}

/// Run one client session. `Ok` means the client went away; `Err` means
/// the channel had to be reset.
async fn serve(stream: TcpStream, node: NodeHandle, config: &ControlConfig) -> Result<(), ControlError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut channel = ControlChannel::new(config.max_bad_frames);
    write_frame(&mut writer, &channel.public_key()).await?;

    // Frames are read on their own task so the select below never cancels
    // a half-read frame.
    let (frames_tx, mut frames) = mpsc::channel(16);
    let max = config.max_frame_size;
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader, max).await;
            let failed = frame.is_err();
            if frames_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    let key_timeout = Duration::from_millis(config.key_exchange_timeout_ms);
    let outcome = session(&mut channel, &mut frames, &mut writer, &node, key_timeout).await;
    reader_task.abort();
    if outcome.is_err() {
        channel.reset();
    }
    let _ = writer.shutdown().await;
    outcome
}

async fn session(
    channel: &mut ControlChannel,
    frames: &mut mpsc::Receiver<Result<Vec<u8>, ControlError>>,
    writer: &mut OwnedWriteHalf,
    node: &NodeHandle,
    key_timeout: Duration,
) -> Result<(), ControlError> {
    let first = tokio::time::timeout(key_timeout, frames.recv())
        .await
        .map_err(|_| ControlError::Protocol(format!("no key frame within {} ms", key_timeout.as_millis())))?;
    let Some(first) = first else {
        return Ok(());
    };
    let first = match first {
        Ok(frame) => frame,
        Err(err) if is_disconnect(&err) => return Ok(()),
        Err(err) => return Err(err),
    };
    channel.accept_key(&first)?;

    let mut events = node.subscribe();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let frame = match frame {
                    None => return Ok(()),
                    Some(Err(err)) if is_disconnect(&err) => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(frame)) => frame,
                };
                if let Opened::Message(request) = channel.open::<ControlRequest>(&frame)? {
                    let reply = answer(node, request).await;
                    write_frame(writer, &channel.seal(&reply)?).await?;
                }
            }
            event = events.recv() => match event {
                Ok(event) => write_frame(writer, &channel.seal(&ControlReply::Event(event))?).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "control client missed node events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn is_disconnect(err: &ControlError) -> bool {
    matches!(
        err,
        ControlError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

async fn answer(node: &NodeHandle, request: ControlRequest) -> ControlReply {
    let outcome = match request {
        ControlRequest::Status => return ControlReply::Status(node.snapshot()),
        ControlRequest::Peers => node.query(NodeQuery::Peers).await,
        ControlRequest::Block { index } => node.query(NodeQuery::BlockByIndex(index)).await,
        ControlRequest::SubmitTransaction(transaction) => {
            return match node.submit_transaction(transaction).await {
                Ok(id) => ControlReply::Ack { id: hex::encode(id) },
                Err(err) => ControlReply::Error {
                    message: err.to_string(),
                },
            };
        }
    };
    match outcome {
        Ok(QueryAnswer::Peers(peers)) => ControlReply::Peers(peers),
        Ok(QueryAnswer::Block(block)) => ControlReply::Block(block),
        Ok(other) => ControlReply::Error {
            message: format!("unexpected answer {other:?}"),
        },
        Err(err) => ControlReply::Error {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, CONTROL_MAX_FRAME_SIZE, EXCHANGE_KEY_LENGTH};
    use crate::control::ControlClient;
    use crate::crypto::NodeKeypair;
    use crate::network::{MemoryNetwork, Node, NodeStatus};
    use crate::storage::MemoryBlockStore;
    use tokio::io::AsyncReadExt;

    async fn server() -> (SocketAddr, Arc<AtomicU64>, NodeHandle, watch::Sender<bool>) {
        server_with(ControlConfig::default()).await
    }

    async fn server_with(control: ControlConfig) -> (SocketAddr, Arc<AtomicU64>, NodeHandle, watch::Sender<bool>) {
        let net = MemoryNetwork::new();
        let keypair = Arc::new(NodeKeypair::generate());
        let (transport, events) = net.endpoint(keypair.peer_id());
        let mut config = NodeConfig::default();
        config.validation_workers = 0;
        let node = Node::new(config, keypair, Arc::new(transport), events, Arc::new(MemoryBlockStore::new())).unwrap();
        let (handle, _task) = node.spawn();

        let control = ControlConfig {
            listen_address: "127.0.0.1:0".into(),
            ..control
        };
        let server = ControlServer::bind(control, handle.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let resets = server.reset_counter();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));
        (addr, resets, handle, stop_tx)
    }

    #[tokio::test]
    async fn status_and_block_requests_are_answered() {
        let (addr, _, handle, _stop) = server().await;
        let mut client = ControlClient::connect(addr).await.unwrap();

        let ControlReply::Status(status) = client.request(ControlRequest::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(&status.peer_id, handle.peer_id());
        assert_eq!(status.status, NodeStatus::Offline);
        assert_eq!(status.height, 0);

        let ControlReply::Block(Some(genesis)) = client.request(ControlRequest::Block { index: 0 }).await.unwrap() else {
            panic!("expected genesis");
        };
        assert_eq!(genesis.index, 0);
        assert_eq!(
            client.request(ControlRequest::Block { index: 5 }).await.unwrap(),
            ControlReply::Block(None)
        );
        assert!(matches!(
            client.request(ControlRequest::Peers).await.unwrap(),
            ControlReply::Peers(peers) if peers.is_empty()
        ));
    }

    #[tokio::test]
    async fn second_client_is_refused_while_busy() {
        let (addr, _, _, _stop) = server().await;
        let mut first = ControlClient::connect(addr).await.unwrap();
        assert!(matches!(ControlClient::connect(addr).await, Err(ControlError::Busy)));
        assert!(first.request(ControlRequest::Status).await.is_ok());
    }

    #[tokio::test]
    async fn bad_frames_reset_the_channel_and_free_the_slot() {
        let (addr, resets, _, _stop) = server().await;
        let mut client = ControlClient::connect(addr).await.unwrap();
        let first_key = client.server_key();
        for _ in 0..3 {
            client.send_raw(b"not a sealed frame").await.unwrap();
        }
        assert!(client.request(ControlRequest::Status).await.is_err());

        let mut next = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(client) = ControlClient::connect(addr).await {
                next = Some(client);
                break;
            }
        }
        let mut next = next.expect("slot never freed");
        assert_ne!(next.server_key(), first_key);
        assert!(next.request(ControlRequest::Status).await.is_ok());
        assert_eq!(resets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn silent_client_loses_the_slot() {
        let (addr, resets, _, _stop) = server_with(ControlConfig {
            key_exchange_timeout_ms: 100,
            ..ControlConfig::default()
        })
        .await;

        let mut silent = TcpStream::connect(addr).await.unwrap();
        let key = read_frame(&mut silent, CONTROL_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(key.len(), EXCHANGE_KEY_LENGTH);

        // The server gives up and closes its end.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), silent.read_to_end(&mut rest))
            .await
            .expect("server kept the silent client")
            .unwrap();

        let mut next = None;
        for _ in 0..50 {
            if let Ok(client) = ControlClient::connect(addr).await {
                next = Some(client);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut next = next.expect("slot never freed");
        assert!(next.request(ControlRequest::Status).await.is_ok());
        assert_eq!(resets.load(Ordering::Relaxed), 1);
    }
}
