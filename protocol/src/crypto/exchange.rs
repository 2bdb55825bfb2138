//! # Ephemeral Key Exchange
//!
//! X25519 Diffie-Hellman for peer links and the control channel. Every
//! connection generates a fresh [`EphemeralKeypair`]; the secret is consumed
//! by the exchange, so a compromised identity key never exposes past
//! traffic.
//!
//! ## Key derivation
//!
//! The raw DH output is never used as a key. It is fed through BLAKE3's
//! `derive_key` mode together with both public keys in canonical
//! (lexicographic) order:
//!
//! ```text
//! session_key = BLAKE3-derive-key(
//!     context = SESSION_KDF_CONTEXT,
//!     input   = shared || min(pub_a, pub_b) || max(pub_a, pub_b))
//! ```
//!
//! so both sides derive the same key without agreeing on who is "ours".
//!
//! ## Low-order points
//!
//! A peer that sends a low-order point forces the shared secret to a known
//! value. `x25519-dalek` reports this as a non-contributory exchange, which
//! we treat as a failed handshake.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use super::CodexError;
use crate::config::{AES_KEY_LENGTH, EXCHANGE_KEY_LENGTH, SESSION_KDF_CONTEXT};

/// One side of an ephemeral X25519 exchange.
///
/// The secret sits in an `Option` and is taken by
/// [`compute_shared_secret`]. A second exchange on the same keypair fails
/// with [`CodexError::SecretConsumed`] instead of silently reusing it.
pub struct EphemeralKeypair {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// The 32 bytes sent to the peer in the clear.
    pub fn public_key_bytes(&self) -> [u8; EXCHANGE_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Whether the secret has already been used.
    pub fn is_consumed(&self) -> bool {
        self.secret.is_none()
    }
}

impl Default for EphemeralKeypair {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// A derived AES-256 session key. Zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; AES_KEY_LENGTH]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Run the exchange against the peer's public key bytes.
///
/// Fails with [`CodexError::KeyExchange`] when `peer_public` is not 32 bytes
/// or is a low-order point, and with [`CodexError::SecretConsumed`] when the
/// keypair was already used.
pub fn compute_shared_secret(
    keypair: &mut EphemeralKeypair,
    peer_public: &[u8],
) -> Result<SessionKey, CodexError> {
    let peer_bytes: [u8; EXCHANGE_KEY_LENGTH] = peer_public
        .try_into()
        .map_err(|_| CodexError::KeyExchange("peer public key must be 32 bytes"))?;

    let secret = keypair.secret.take().ok_or(CodexError::SecretConsumed)?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer_bytes));
    if !shared.was_contributory() {
        return Err(CodexError::KeyExchange("non-contributory peer public key"));
    }

    Ok(derive_session_key(
        shared.as_bytes(),
        &keypair.public.to_bytes(),
        &peer_bytes,
    ))
}

fn derive_session_key(shared: &[u8; 32], ours: &[u8; 32], theirs: &[u8; 32]) -> SessionKey {
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
    hasher.update(shared);

    let (first, second) = if ours <= theirs {
        (ours, theirs)
    } else {
        (theirs, ours)
    };
    hasher.update(first);
    hasher.update(second);

    let mut key = [0u8; AES_KEY_LENGTH];
    hasher.finalize_xof().fill(&mut key);
    SessionKey(key)
}
