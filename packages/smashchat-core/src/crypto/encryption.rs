//! # Payload Encryption
//!
//! AES-256-GCM for message bodies, wrapped keys and key storage at rest.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PAYLOAD ENCRYPTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  AES-256-GCM(                                                          │
//! │    key   = conversation key (32 bytes),                                │
//! │    nonce = 12 random bytes, fresh per call,                            │
//! │    msg   = plaintext,                                                  │
//! │    aad   = conversation id                                             │
//! │  )                                                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ciphertext ║ tag(16)  ──split──►  EncryptedPayload {                   │
//! │                                      ciphertext, nonce, auth_tag }      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decryption with a wrong key, a tampered ciphertext/tag or a different AAD
//! fails with [`Error::AuthenticationFailed`]; no partial plaintext is ever
//! returned.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce for AES-GCM encryption
///
/// **Never reuse a nonce with the same key.** Nonces are drawn from the OS
/// RNG, which is safe for up to 2^32 messages per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("Nonce must be {} bytes", NONCE_SIZE)))?;
        Ok(Self(array))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM key
///
/// Zeroized when dropped. `Debug` never prints the key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

/// The symmetric secret shared by all members of one conversation version
pub type ConversationKey = EncryptionKey;

impl EncryptionKey {
    /// Fresh random 256-bit key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("Key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(array))
    }

    /// Raw key bytes
    ///
    /// Only for wrapping and storage. Never log these.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// An encrypted message body with its tag split out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub auth_tag: [u8; TAG_SIZE],
}

/// Encrypt with AES-256-GCM
///
/// Returns `(nonce, ciphertext || tag)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    Ok((nonce, ciphertext))
}

/// Decrypt AES-256-GCM `ciphertext || tag`
///
/// Fails with `AuthenticationFailed` if the ciphertext, tag, nonce, key or
/// AAD differ from what was used to encrypt.
pub fn decrypt(
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::InvalidKey(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|_| Error::AuthenticationFailed)
}

/// Encrypt a message body for a conversation
pub fn encrypt_payload(
    plaintext: &[u8],
    key: &ConversationKey,
    aad: &[u8],
) -> Result<EncryptedPayload> {
    let (nonce, mut combined) = encrypt(key, plaintext, aad)?;

    let split = combined
        .len()
        .checked_sub(TAG_SIZE)
        .ok_or_else(|| Error::EncryptionFailed("Ciphertext shorter than tag".into()))?;
    let tag = combined.split_off(split);

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(&tag);

    Ok(EncryptedPayload {
        ciphertext: combined,
        nonce: nonce.0,
        auth_tag,
    })
}

/// Decrypt a message body
pub fn decrypt_payload(
    payload: &EncryptedPayload,
    key: &ConversationKey,
    aad: &[u8],
) -> Result<Vec<u8>> {
    let mut combined = Vec::with_capacity(payload.ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(&payload.ciphertext);
    combined.extend_from_slice(&payload.auth_tag);

    decrypt(key, &Nonce(payload.nonce), &combined, aad)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_basic() {
        let key = EncryptionKey::from_bytes([42u8; 32]);
        let plaintext = b"Hello, World!";
        let aad = b"context";

        let (nonce, ciphertext) = encrypt(&key, plaintext, aad).unwrap();
        let decrypted = decrypt(&key, &nonce, &ciphertext, aad).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_payload_round_trip() {
        let key = ConversationKey::generate();
        let payload = encrypt_payload(b"hi", &key, b"conv-1").unwrap();

        assert_eq!(payload.ciphertext.len(), 2);
        assert_eq!(decrypt_payload(&payload, &key, b"conv-1").unwrap(), b"hi");
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let key = ConversationKey::generate();
        let payload = encrypt_payload(b"", &key, b"").unwrap();
        assert!(payload.ciphertext.is_empty());
        assert!(decrypt_payload(&payload, &key, b"").unwrap().is_empty());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let key = ConversationKey::generate();
        let payload = encrypt_payload(b"Hello, World!", &key, b"conv-1").unwrap();

        let mut bad_ct = payload.clone();
        bad_ct.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            decrypt_payload(&bad_ct, &key, b"conv-1"),
            Err(Error::AuthenticationFailed)
        ));

        let mut bad_tag = payload.clone();
        bad_tag.auth_tag[15] ^= 0x01;
        assert!(matches!(
            decrypt_payload(&bad_tag, &key, b"conv-1"),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_aad_or_key_fails() {
        let key = ConversationKey::generate();
        let payload = encrypt_payload(b"secret", &key, b"conv-1").unwrap();

        assert!(matches!(
            decrypt_payload(&payload, &key, b"conv-2"),
            Err(Error::AuthenticationFailed)
        ));
        assert!(matches!(
            decrypt_payload(&payload, &ConversationKey::generate(), b"conv-1"),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = ConversationKey::generate();
        let p1 = encrypt_payload(b"same", &key, b"").unwrap();
        let p2 = encrypt_payload(b"same", &key, b"").unwrap();

        assert_ne!(p1.nonce, p2.nonce);
        assert_ne!(p1.ciphertext, p2.ciphertext);
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", key), "EncryptionKey(..)");
    }

    #[test]
    fn test_key_from_slice_checks_length() {
        assert!(EncryptionKey::from_slice(&[0u8; 31]).is_err());
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
        assert!(Nonce::from_slice(&[0u8; 11]).is_err());
    }
}
