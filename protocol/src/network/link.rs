//! # Link
//!
//! Per-peer encrypted sessions on top of a raw [`Transport`](super::transport::Transport).
//!
//! ## Handshake
//!
//! As soon as a connection is up, each side sends one plaintext
//! [`Frame::Handshake`]:
//!
//! ```text
//! Handshake {
//!     version, identity (Ed25519 pk), ephemeral (X25519 pk),
//!     signature = Sign(identity_sk, HANDSHAKE_CONTEXT || ephemeral || identity),
//!     is_public, listen_address, neighbors
//! }
//! ```
//!
//! A handshake is accepted only if `identity` hashes to the same `PeerId`
//! the transport reported and the signature verifies. Both sides then run
//! the ephemeral exchange and every later frame is [`Frame::Sealed`] with
//! the derived session key.
//!
//! ## Invariants
//!
//! - At most one session per peer. A second handshake on an established
//!   session is a [`ProtocolError::DuplicateHandshake`].
//! - A sealed frame before key exchange is a
//!   [`ProtocolError::SealedBeforeHandshake`]. The frame is dropped; the
//!   connection stays up.
//! - [`Link::reset`] drops the session, and with it the zeroizing
//!   [`SessionKey`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::peer_store::PeerAnnouncement;
use crate::config::{HANDSHAKE_CONTEXT, MAX_FRAME_SIZE, WIRE_PROTOCOL_VERSION};
use crate::crypto::encryption;
use crate::crypto::exchange::{compute_shared_secret, EphemeralKeypair, SessionKey};
use crate::crypto::keys::{NodeKeypair, NodePublicKey, NodeSignature, PeerId};
use crate::crypto::CodexError;

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u16,
    pub identity: [u8; 32],
    pub ephemeral: [u8; 32],
    pub signature: NodeSignature,
    pub is_public: bool,
    pub listen_address: Option<String>,
    pub neighbors: Vec<PeerId>,
}

impl Handshake {
    fn signing_bytes(ephemeral: &[u8; 32], identity: &[u8; 32]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + 64);
        msg.extend_from_slice(HANDSHAKE_CONTEXT);
        msg.extend_from_slice(ephemeral);
        msg.extend_from_slice(identity);
        msg
    }

    pub fn announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            peer_id: PeerId::from_public_key(&self.identity),
            is_public: self.is_public,
            address: self.listen_address.clone(),
            neighbors: self.neighbors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Handshake(Handshake),
    Sealed(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("sealed frame from {0} before key exchange")]
    SealedBeforeHandshake(PeerId),

    #[error("second handshake from {0} on an established session")]
    DuplicateHandshake(PeerId),

    #[error("handshake identity does not match connection peer {0}")]
    IdentityMismatch(PeerId),

    #[error("bad handshake signature from {0}")]
    BadSignature(PeerId),

    #[error("wire version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("no session with {0}")]
    NoSession(PeerId),

    #[error("undecryptable frame from {0}")]
    Decrypt(PeerId),

    #[error("crypto: {0}")]
    Codex(#[from] CodexError),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

enum Session {
    /// Our handshake is out, theirs has not arrived.
    Pending(EphemeralKeypair),
    Established(SessionKey),
}

/// What a received frame turned into.
#[derive(Debug)]
pub enum Inbound {
    /// Key exchange completed. `reply` is our own handshake when the peer
    /// spoke first and we had not sent one yet.
    Established {
        announcement: PeerAnnouncement,
        reply: Option<Vec<u8>>,
    },
    /// A decrypted payload.
    Payload(Vec<u8>),
}

/// Local facts advertised in our handshake.
#[derive(Debug, Clone, Default)]
pub struct LocalInfo {
    pub is_public: bool,
    pub listen_address: Option<String>,
    pub neighbors: Vec<PeerId>,
}

pub struct Link {
    keypair: Arc<NodeKeypair>,
    sessions: DashMap<PeerId, Session>,
}

impl Link {
    pub fn new(keypair: Arc<NodeKeypair>) -> Self {
        Self {
            keypair,
            sessions: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// Start a session with `peer` and return our encoded handshake frame.
    /// Any previous session with the peer is discarded.
    pub fn begin(&self, peer: &PeerId, local: &LocalInfo) -> Result<Vec<u8>, ProtocolError> {
        let ephemeral = EphemeralKeypair::generate();
        let frame = self.handshake_frame(&ephemeral, local)?;
        self.sessions.insert(peer.clone(), Session::Pending(ephemeral));
        trace!(peer = %peer.short(), "handshake sent");
        Ok(frame)
    }

    fn handshake_frame(&self, ephemeral: &EphemeralKeypair, local: &LocalInfo) -> Result<Vec<u8>, ProtocolError> {
        let identity = self.keypair.public_key_bytes();
        let ephemeral_pub = ephemeral.public_key_bytes();
        let signature = self
            .keypair
            .sign(&Handshake::signing_bytes(&ephemeral_pub, &identity));
        Frame::Handshake(Handshake {
            version: WIRE_PROTOCOL_VERSION,
            identity,
            ephemeral: ephemeral_pub,
            signature,
            is_public: local.is_public,
            listen_address: local.listen_address.clone(),
            neighbors: local.neighbors.clone(),
        })
        .encode()
    }

    /// Process one frame from `peer`.
    pub fn receive(&self, peer: &PeerId, bytes: &[u8], local: &LocalInfo) -> Result<Inbound, ProtocolError> {
        match Frame::decode(bytes)? {
            Frame::Handshake(handshake) => self.accept_handshake(peer, handshake, local),
            Frame::Sealed(ciphertext) => {
                let session = self
                    .sessions
                    .get(peer)
                    .ok_or_else(|| ProtocolError::SealedBeforeHandshake(peer.clone()))?;
                let Session::Established(key) = &*session else {
                    return Err(ProtocolError::SealedBeforeHandshake(peer.clone()));
                };
                let plaintext = encryption::decrypt(key.as_bytes(), &ciphertext)
                    .map_err(|_| ProtocolError::Decrypt(peer.clone()))?;
                Ok(Inbound::Payload(plaintext))
            }
        }
    }

    fn accept_handshake(
        &self,
        peer: &PeerId,
        handshake: Handshake,
        local: &LocalInfo,
    ) -> Result<Inbound, ProtocolError> {
        if handshake.version != WIRE_PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                ours: WIRE_PROTOCOL_VERSION,
                theirs: handshake.version,
            });
        }
        if PeerId::from_public_key(&handshake.identity) != *peer {
            return Err(ProtocolError::IdentityMismatch(peer.clone()));
        }
        let signed = Handshake::signing_bytes(&handshake.ephemeral, &handshake.identity);
        if !NodePublicKey::from_bytes(handshake.identity).verify(&signed, &handshake.signature) {
            return Err(ProtocolError::BadSignature(peer.clone()));
        }

        let mut reply = None;
        let mut entry = match self.sessions.entry(peer.clone()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                // The peer spoke first; answer with our own handshake.
                let ephemeral = EphemeralKeypair::generate();
                reply = Some(self.handshake_frame(&ephemeral, local)?);
                vacant.insert(Session::Pending(ephemeral))
            }
        };
        let derived = match &mut *entry {
            Session::Established(_) => {
                return Err(ProtocolError::DuplicateHandshake(peer.clone()));
            }
            Session::Pending(ephemeral) => compute_shared_secret(ephemeral, &handshake.ephemeral),
        };
        match derived {
            Ok(key) => *entry = Session::Established(key),
            Err(err) => {
                drop(entry);
                self.sessions.remove(peer);
                return Err(err.into());
            }
        }
        drop(entry);

        debug!(peer = %peer.short(), "session established");
        Ok(Inbound::Established {
            announcement: handshake.announcement(),
            reply,
        })
    }

    /// Encrypt `plaintext` for `peer` and wrap it in a frame.
    pub fn seal(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let session = self
            .sessions
            .get(peer)
            .ok_or_else(|| ProtocolError::NoSession(peer.clone()))?;
        let Session::Established(key) = &*session else {
            return Err(ProtocolError::NoSession(peer.clone()));
        };
        let ciphertext = encryption::encrypt(key.as_bytes(), plaintext)?;
        drop(session);
        Frame::Sealed(ciphertext).encode()
    }

    pub fn is_established(&self, peer: &PeerId) -> bool {
        self.sessions
            .get(peer)
            .is_some_and(|s| matches!(*s, Session::Established(_)))
    }

    /// Forget the session with `peer`. The key is zeroed on drop.
    pub fn reset(&self, peer: &PeerId) {
        if self.sessions.remove(peer).is_some() {
            trace!(peer = %peer.short(), "session reset");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
