//! # NodeController
//!
//! A local, encrypted request/response channel between the node process and
//! a supervising process such as a desktop UI or the `kestrel-node status`
//! command.
//!
//! ## Wire format
//!
//! Every frame is a big-endian `u32` length followed by that many bytes, at
//! most [`CONTROL_MAX_FRAME_SIZE`]. The first frame in each direction is a
//! bare 32-byte X25519 public key. Every later frame is AES-256-GCM sealed
//! JSON shaped `{ "type": ..., "data": ... }`.
//!
//! ```text
//! server                          client
//!   |---- [u32][server key] ------->|
//!   |<--- [u32][client key] --------|
//!   |<--- [u32][sealed request] ----|
//!   |---- [u32][sealed reply] ----->|
//!   |---- [u32][sealed event] ----->|   (pushed at any time)
//! ```
//!
//! ## Failure handling
//!
//! A malformed or missing key frame is a protocol error and resets the
//! channel; a client gets `key_exchange_timeout_ms` to send one. After
//! the exchange, frames that fail to decrypt or parse are dropped, and
//! [`CONTROL_MAX_BAD_FRAMES`] of them in a row reset it too. A reset throws
//! away the session key, generates a fresh ephemeral keypair and frees the
//! slot for the next client.

pub mod channel;
pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::chain::{FinalizedBlock, Transaction};
use crate::config::{
    CONTROL_KEY_EXCHANGE_TIMEOUT, CONTROL_MAX_BAD_FRAMES, CONTROL_MAX_FRAME_SIZE, DEFAULT_CONTROL_PORT,
};
use crate::crypto::CodexError;
use crate::network::{NodeEvent, NodeSnapshot, PeerRecord};

pub use channel::{read_frame, write_frame, ControlChannel, Opened};
pub use client::ControlClient;
pub use server::{ControlServer, Slot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    /// Socket address to listen on. Keep it on loopback.
    pub listen_address: String,
    pub max_frame_size: usize,
    pub max_bad_frames: u32,
    /// A client silent this long after connecting is dropped.
    pub key_exchange_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"),
            max_frame_size: CONTROL_MAX_FRAME_SIZE,
            max_bad_frames: CONTROL_MAX_BAD_FRAMES,
            key_exchange_timeout_ms: CONTROL_KEY_EXCHANGE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("control protocol: {0}")]
    Protocol(String),

    #[error("key exchange: {0}")]
    KeyExchange(#[from] CodexError),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{0} consecutive bad frames")]
    TooManyBadFrames(u32),

    #[error("control channel is busy")]
    Busy,

    #[error("control channel closed")]
    Closed,

    #[error("control message encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ControlRequest {
    Status,
    Peers,
    Block { index: u64 },
    SubmitTransaction(Transaction),
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ControlReply {
    Status(NodeSnapshot),
    Peers(Vec<PeerRecord>),
    Block(Option<FinalizedBlock>),
    /// A submitted transaction was pooled; carries its hex id.
    Ack { id: String },
    Error { message: String },
    Event(NodeEvent),
}
