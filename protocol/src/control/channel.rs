//! Control channel state and framing, free of sockets.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::ControlError;
use crate::config::EXCHANGE_KEY_LENGTH;
use crate::crypto::{compute_shared_secret, decrypt, encrypt, EphemeralKeypair, SessionKey};

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>, ControlError> {
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(ControlError::FrameTooLarge { len, max });
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<(), ControlError> {
    let len = u32::try_from(frame.len()).map_err(|_| ControlError::FrameTooLarge {
        len: frame.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// What [`ControlChannel::open`] made of a sealed frame.
#[derive(Debug, PartialEq)]
pub enum Opened<T> {
    Message(T),
    /// Undecryptable or unparsable; dropped and counted.
    Dropped,
}

/// One end of the control channel.
///
/// Holds the ephemeral keypair until the peer's key arrives, then the
/// session key. Both sides of the channel use this type.
pub struct ControlChannel {
    ephemeral: EphemeralKeypair,
    public: [u8; EXCHANGE_KEY_LENGTH],
    session: Option<SessionKey>,
    bad_frames: u32,
    max_bad_frames: u32,
    resets: u64,
}

impl ControlChannel {
    pub fn new(max_bad_frames: u32) -> Self {
        let ephemeral = EphemeralKeypair::generate();
        Self {
            public: ephemeral.public_key_bytes(),
            ephemeral,
            session: None,
            bad_frames: 0,
            max_bad_frames,
            resets: 0,
        }
    }

    /// Our key frame.
    pub fn public_key(&self) -> [u8; EXCHANGE_KEY_LENGTH] {
        self.public
    }

    pub fn is_established(&self) -> bool {
        self.session.is_some()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Consume the peer's first frame.
    pub fn accept_key(&mut self, frame: &[u8]) -> Result<(), ControlError> {
        if self.session.is_some() {
            return Err(ControlError::Protocol("key frame on an established channel".into()));
        }
        if frame.len() != EXCHANGE_KEY_LENGTH {
            return Err(ControlError::Protocol(format!(
                "expected a {EXCHANGE_KEY_LENGTH}-byte key frame, got {} bytes",
                frame.len()
            )));
        }
        self.session = Some(compute_shared_secret(&mut self.ephemeral, frame)?);
        debug!("control channel established");
        Ok(())
    }

    pub fn seal<T: Serialize>(&self, message: &T) -> Result<Vec<u8>, ControlError> {
        let key = self.session.as_ref().ok_or(ControlError::Closed)?;
        let json = serde_json::to_vec(message)?;
        Ok(encrypt(key.as_bytes(), &json)?)
    }

    /// Decrypt and parse a sealed frame. Bad frames are dropped until
    /// `max_bad_frames` arrive in a row, which is an error.
    pub fn open<T: DeserializeOwned>(&mut self, frame: &[u8]) -> Result<Opened<T>, ControlError> {
        let key = self
            .session
            .as_ref()
            .ok_or_else(|| ControlError::Protocol("sealed frame before key exchange".into()))?;
        let parsed = decrypt(key.as_bytes(), frame)
            .ok()
            .and_then(|json| serde_json::from_slice::<T>(&json).ok());
        match parsed {
            Some(message) => {
                self.bad_frames = 0;
                Ok(Opened::Message(message))
            }
            None => {
                self.bad_frames += 1;
                if self.bad_frames >= self.max_bad_frames {
                    warn!(bad_frames = self.bad_frames, "too many bad control frames");
                    return Err(ControlError::TooManyBadFrames(self.bad_frames));
                }
                debug!(bad_frames = self.bad_frames, "bad control frame dropped");
                Ok(Opened::Dropped)
            }
        }
    }

    /// Forget the session and start over with a fresh keypair.
    pub fn reset(&mut self) {
        self.ephemeral = EphemeralKeypair::generate();
        self.public = self.ephemeral.public_key_bytes();
        self.session = None;
        self.bad_frames = 0;
        self.resets += 1;
        debug!(resets = self.resets, "control channel reset");
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("established", &self.is_established())
            .field("bad_frames", &self.bad_frames)
            .field("resets", &self.resets)
            .finish()
    }
}
