//! # Signatures
//!
//! Thin wrappers over [`NodeKeypair::sign`] and [`NodePublicKey::verify`],
//! plus the wire-facing variant that starts from raw bytes or a [`PeerId`].
//!
//! Verification always returns `bool`. A failed check is something the
//! caller logs and discards; there is no error type to propagate because
//! there is nothing a peer-supplied bad signature should cause upstream.

use super::keys::{NodeKeypair, NodePublicKey, NodeSignature, PeerId};

/// Sign `message` with the node identity key.
pub fn sign(keypair: &NodeKeypair, message: &[u8]) -> NodeSignature {
    keypair.sign(message)
}

/// Verify a signature against a typed public key.
pub fn verify(public_key: &NodePublicKey, message: &[u8], signature: &NodeSignature) -> bool {
    public_key.verify(message, signature)
}

/// Verify using raw key and signature bytes as they arrive off the wire.
/// Wrong lengths verify as `false`.
pub fn verify_raw(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = NodePublicKey::try_from_slice(public_key) else {
        return false;
    };
    key.verify(message, &NodeSignature::from_bytes(signature.to_vec()))
}

/// Verify a signature claimed to be made by `peer`.
pub fn verify_peer(peer: &PeerId, message: &[u8], signature: &NodeSignature) -> bool {
    match peer.public_key() {
        Ok(key) => key.verify(message, signature),
        Err(_) => false,
    }
}
