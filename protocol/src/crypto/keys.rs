//! # Node Identity Keys
//!
//! Every Kestrel node has one long-term Ed25519 keypair. Its public half,
//! hex encoded, is the node's [`PeerId`]: the identity used in handshakes,
//! on gossip envelopes, in topology records and as the block proposer.
//!
//! ## Security considerations
//!
//! - Secret bytes are zeroized on drop by `ed25519-dalek`.
//! - `NodeKeypair` does not implement `Serialize`. Writing a key to disk is
//!   an explicit [`NodeKeypair::store`] call, never a side effect of
//!   serializing some bigger struct.
//! - Key bytes are never logged. `Debug` prints the public half only.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::CodexError;

/// Long-term Ed25519 identity of a node.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

/// Public half of a node identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature.
///
/// Stored as `Vec<u8>` for serde. Always 64 bytes when produced locally; a
/// signature of any other length off the wire simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature {
    bytes: Vec<u8>,
}

impl NodeKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests and simulations use
    /// this to get stable peer ids.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, CodexError> {
        let mut raw = hex::decode(hex_str.trim()).map_err(|_| CodexError::InvalidKey)?;
        let seed: Result<[u8; 32], _> = raw.as_slice().try_into();
        raw.zeroize();
        let mut seed = seed.map_err(|_| CodexError::InvalidKey)?;
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        Ok(keypair)
    }

    /// Hex encoding of the secret. Handle with care.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Load a hex-encoded secret from a key file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CodexError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_hex(&raw)
    }

    /// Write the hex-encoded secret to a key file. On unix the file is
    /// created owner-readable only.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), CodexError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.secret_hex())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the key at `path`, or generate and store a new one if the file
    /// does not exist yet.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, CodexError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        keypair.store(path)?;
        Ok(keypair)
    }

    pub fn public_key(&self) -> NodePublicKey {
        NodePublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> bool {
        self.public_key().verify(message, signature)
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

impl NodePublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, CodexError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CodexError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Returns `false` for a malformed key, a malformed signature or a
    /// signature that does not match. Callers never learn which.
    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Some(sig) = signature.to_dalek() else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublicKey({})", self.to_hex())
    }
}

impl NodeSignature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn to_dalek(&self) -> Option<DalekSignature> {
        let bytes: [u8; 64] = self.bytes.as_slice().try_into().ok()?;
        Some(DalekSignature::from_bytes(&bytes))
    }
}

impl fmt::Debug for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.bytes[..self.bytes.len().min(8)];
        write!(f, "NodeSignature({}..)", hex::encode(shown))
    }
}

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identity of a peer: the lowercase hex encoding of its Ed25519 public key.
///
/// A `PeerId` is cheap to clone and totally ordered so it can key
/// `BTreeMap`s and `BTreeSet`s. Parsing validates both the hex length and
/// that the bytes are a valid Edwards point, so a `PeerId` obtained through
/// [`FromStr`] or [`PeerId::from_public_key`] always maps back to a
/// verifying key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_public_key(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the verifying key behind this id.
    pub fn public_key(&self) -> Result<NodePublicKey, CodexError> {
        let raw = hex::decode(&self.0).map_err(|_| CodexError::InvalidKey)?;
        let key = NodePublicKey::try_from_slice(&raw)?;
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| CodexError::InvalidKey)?;
        Ok(key)
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl FromStr for PeerId {
    type Err = CodexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.trim().to_ascii_lowercase());
        id.public_key()?;
        Ok(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}
