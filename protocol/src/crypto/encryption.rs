//! # AES-256-GCM Encryption
//!
//! Authenticated encryption for peer links and the control channel.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from `OsRng`. The birthday bound is around 2^48
//! messages per key, and every key here is an ephemeral session key that
//! dies with its connection, so counters buy nothing.
//!
//! ## Wire format
//!
//! `nonce (12) || ciphertext || tag (16)`. [`decrypt`] expects exactly what
//! [`encrypt`] produces. Truncated, tampered or wrongly-keyed input is one
//! and the same [`CodexError::Authentication`]; the caller does not get to
//! learn which.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use super::CodexError;
use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(key: &[u8; AES_KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CodexError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodexError::InvalidKey)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CodexError::Encryption)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext+tag`.
pub fn decrypt(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, CodexError> {
    if data.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(CodexError::Authentication);
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodexError::InvalidKey)?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CodexError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = test_key();
        let sealed = encrypt(&key, b"get blocks 9..=10").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"get blocks 9..=10");
    }

    #[test]
    fn test_ciphertext_layout() {
        let key = test_key();
        let sealed = encrypt(&key, b"abc").unwrap();
        assert_eq!(sealed.len(), AES_NONCE_LENGTH + 3 + AES_TAG_LENGTH);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = test_key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a[..AES_NONCE_LENGTH], b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn test_wrong_key_is_authentication_error() {
        let sealed = encrypt(&test_key(), b"secret").unwrap();
        assert!(matches!(
            decrypt(&test_key(), &sealed),
            Err(CodexError::Authentication)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_authentication_error() {
        let key = test_key();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(decrypt(&key, &sealed), Err(CodexError::Authentication)));
    }

    #[test]
    fn test_truncated_input_never_panics() {
        let key = test_key();
        let sealed = encrypt(&key, b"secret").unwrap();
        for len in 0..sealed.len() {
            assert!(matches!(
                decrypt(&key, &sealed[..len]),
                Err(CodexError::Authentication)
            ));
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let sealed = encrypt(&key, b"").unwrap();
        assert!(decrypt(&key, &sealed).unwrap().is_empty());
    }
}
