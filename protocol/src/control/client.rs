//! Client side of the control channel.

use std::collections::VecDeque;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use super::channel::{read_frame, write_frame, ControlChannel, Opened};
use super::{ControlConfig, ControlError, ControlReply, ControlRequest};
use crate::config::EXCHANGE_KEY_LENGTH;
use crate::network::NodeEvent;

/// Connects to a node's control server and exchanges sealed requests.
///
/// Events the node pushes while a request is in flight are buffered and
/// handed out by [`ControlClient::next_event`].
pub struct ControlClient {
    stream: TcpStream,
    channel: ControlChannel,
    server_key: [u8; EXCHANGE_KEY_LENGTH],
    max_frame_size: usize,
    events: VecDeque<NodeEvent>,
}

impl ControlClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ControlError> {
        Self::connect_with(addr, &ControlConfig::default()).await
    }

    pub async fn connect_with(addr: impl ToSocketAddrs, config: &ControlConfig) -> Result<Self, ControlError> {
        let mut stream = TcpStream::connect(addr).await?;
        // A busy server closes the connection instead of sending its key.
        let key_frame = read_frame(&mut stream, config.max_frame_size)
            .await
            .map_err(|err| match err {
                ControlError::Io(io)
                    if matches!(
                        io.kind(),
                        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    ControlError::Busy
                }
                other => other,
            })?;
        let server_key: [u8; EXCHANGE_KEY_LENGTH] = key_frame.as_slice().try_into().map_err(|_| {
            ControlError::Protocol(format!("server sent a {}-byte key frame", key_frame.len()))
        })?;

        let mut channel = ControlChannel::new(config.max_bad_frames);
        write_frame(&mut stream, &channel.public_key()).await?;
        channel.accept_key(&server_key)?;
        debug!("control client connected");
        Ok(Self {
            stream,
            channel,
            server_key,
            max_frame_size: config.max_frame_size,
            events: VecDeque::new(),
        })
    }

    /// The ephemeral key the server opened this session with.
    pub fn server_key(&self) -> [u8; EXCHANGE_KEY_LENGTH] {
        self.server_key
    }

    pub async fn request(&mut self, request: ControlRequest) -> Result<ControlReply, ControlError> {
        let frame = self.channel.seal(&request)?;
        write_frame(&mut self.stream, &frame).await?;
        loop {
            match self.read_reply().await? {
                ControlReply::Event(event) => self.events.push_back(event),
                reply => return Ok(reply),
            }
        }
    }

    /// The next pushed node event, waiting for one if none is buffered.
    pub async fn next_event(&mut self) -> Result<NodeEvent, ControlError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read_reply().await? {
                ControlReply::Event(event) => return Ok(event),
                other => debug!(?other, "unsolicited control reply ignored"),
            }
        }
    }

    /// Write an arbitrary frame, sealed or not.
    pub async fn send_raw(&mut self, frame: &[u8]) -> Result<(), ControlError> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn close(mut self) -> Result<(), ControlError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<ControlReply, ControlError> {
        loop {
            let frame = read_frame(&mut self.stream, self.max_frame_size).await?;
            if let Opened::Message(reply) = self.channel.open::<ControlReply>(&frame)? {
                return Ok(reply);
            }
        }
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("channel", &self.channel)
            .field("buffered_events", &self.events.len())
            .finish()
    }
}
