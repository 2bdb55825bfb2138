//! # CryptoCodex
//!
//! Every hash, signature, key exchange and sealed frame in Kestrel goes
//! through this module:
//!
//! - **Ed25519** for node identity and signatures.
//! - **X25519** for ephemeral per-connection key exchange.
//! - **AES-256-GCM** for sealing frames on peer links and the control channel.
//! - **BLAKE3** for hashing and key derivation.
//!
//! Everything here is a thin typed wrapper over audited crates. Errors are
//! coarse: a peer learns that a handshake or frame failed, not
//! why.

pub mod encryption;
pub mod exchange;
pub mod hash;
pub mod keys;
pub mod signatures;

use thiserror::Error;

pub use encryption::{decrypt, encrypt};
pub use exchange::{compute_shared_secret, EphemeralKeypair, SessionKey};
pub use hash::{blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root, Hash32};
pub use keys::{NodeKeypair, NodePublicKey, NodeSignature, PeerId};
pub use signatures::{sign, verify, verify_peer};

/// Errors raised by the codex.
#[derive(Debug, Error)]
pub enum CodexError {
    /// The peer's exchange key was malformed or low-order.
    #[error("key exchange failed: {0}")]
    KeyExchange(&'static str),

    /// The ephemeral secret was already used by an earlier exchange.
    #[error("ephemeral secret already consumed")]
    SecretConsumed,

    /// Decryption failed: wrong key, tampered or truncated ciphertext.
    #[error("authentication failed")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("invalid key material")]
    InvalidKey,

    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}
