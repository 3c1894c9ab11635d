//! # Key Wrapping
//!
//! Wraps a conversation key for one member so that only the holder of the
//! member's identity secret can recover it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WRAPPED KEY LAYOUT                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   0            32            44                               92        │
//! │   ├────────────┼─────────────┼────────────────────────────────┤         │
//! │   │ ephemeral  │   nonce     │  AES-GCM(conversation key) +   │         │
//! │   │ X25519 pub │  (12 bytes) │  16-byte tag                   │         │
//! │   └────────────┴─────────────┴────────────────────────────────┘         │
//! │                                                                         │
//! │   wrap:   fresh ephemeral secret per call (two copies of the same      │
//! │           key never share bytes)                                        │
//! │   unwrap: identity_secret × ephemeral_pub → same wrapping key           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use super::encryption::{decrypt, encrypt, ConversationKey, Nonce, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use super::kdf::derive_wrapping_key;
use super::keys::{IdentityKeyPair, PublicKey, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};

/// Total size of a wrapped key in bytes
pub const WRAPPED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// A conversation key encrypted for exactly one member
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    /// Parse raw bytes, checking the length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != WRAPPED_KEY_SIZE {
            return Err(Error::KeyUnwrapError(format!(
                "Wrapped key must be {} bytes, got {}",
                WRAPPED_KEY_SIZE,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Decode the base64 wire form
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::KeyUnwrapError(format!("Invalid wrapped key encoding: {}", e)))?;
        Self::from_bytes(bytes)
    }

    /// Base64 wire form
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn parts(&self) -> ([u8; PUBLIC_KEY_SIZE], Nonce, &[u8]) {
        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&self.0[..PUBLIC_KEY_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&self.0[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE]);
        (
            ephemeral,
            Nonce::from_bytes(nonce),
            &self.0[PUBLIC_KEY_SIZE + NONCE_SIZE..],
        )
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

impl Serialize for WrappedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        WrappedKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Wrap `key` for the holder of `recipient`'s identity secret
pub fn wrap_key(key: &ConversationKey, recipient: &PublicKey) -> Result<WrappedKey> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*recipient.as_bytes()));
    if !shared.was_contributory() {
        return Err(Error::InvalidKey(
            "Recipient public key is a low-order point".into(),
        ));
    }

    let wrapping_key = derive_wrapping_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )?;
    let (nonce, ciphertext) = encrypt(&wrapping_key, key.as_bytes(), &[])?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&ciphertext);
    WrappedKey::from_bytes(out)
}

/// Recover a conversation key wrapped for `own`
///
/// Any corruption, or a copy wrapped for somebody else, fails with
/// `KeyUnwrapError`.
pub fn unwrap_key(wrapped: &WrappedKey, own: &IdentityKeyPair) -> Result<ConversationKey> {
    let (ephemeral, nonce, ciphertext) = wrapped.parts();

    let shared = own.diffie_hellman(&PublicKey::from_bytes(ephemeral));
    if !shared.was_contributory() {
        return Err(Error::KeyUnwrapError("Degenerate ephemeral key".into()));
    }

    let wrapping_key =
        derive_wrapping_key(shared.as_bytes(), &ephemeral, own.public_key().as_bytes())?;

    let raw = decrypt(&wrapping_key, &nonce, ciphertext, &[])
        .map(Zeroizing::new)
        .map_err(|_| Error::KeyUnwrapError("Wrong key or corrupted data".into()))?;

    ConversationKey::from_slice(&raw)
        .map_err(|_| Error::KeyUnwrapError("Unwrapped key has the wrong length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let member = IdentityKeyPair::generate();
        let key = ConversationKey::generate();

        let wrapped = wrap_key(&key, &member.public_key()).unwrap();
        assert_eq!(wrapped.as_bytes().len(), WRAPPED_KEY_SIZE);

        let recovered = unwrap_key(&wrapped, &member).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn test_each_wrap_is_distinct() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let key = ConversationKey::generate();

        let wa = wrap_key(&key, &a.public_key()).unwrap();
        let wb = wrap_key(&key, &b.public_key()).unwrap();
        let wa2 = wrap_key(&key, &a.public_key()).unwrap();
        assert_ne!(wa, wb);
        assert_ne!(wa, wa2);

        // A cannot open B's copy
        assert!(matches!(unwrap_key(&wb, &a), Err(Error::KeyUnwrapError(_))));
        assert_eq!(unwrap_key(&wa, &a).unwrap(), unwrap_key(&wb, &b).unwrap());
    }

    #[test]
    fn test_corrupted_wrap_fails() {
        let member = IdentityKeyPair::generate();
        let wrapped = wrap_key(&ConversationKey::generate(), &member.public_key()).unwrap();

        let mut bytes = wrapped.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let corrupted = WrappedKey::from_bytes(bytes).unwrap();
        assert!(matches!(
            unwrap_key(&corrupted, &member),
            Err(Error::KeyUnwrapError(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            WrappedKey::from_bytes(vec![0u8; 10]),
            Err(Error::KeyUnwrapError(_))
        ));
        assert!(WrappedKey::from_base64("%%%").is_err());
    }

    #[test]
    fn test_low_order_recipient_rejected() {
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            wrap_key(&ConversationKey::generate(), &zero),
            Err(Error::InvalidKey(_))
        ));

        // A wrapped key carrying an all-zero ephemeral key never unwraps
        let member = IdentityKeyPair::generate();
        let forged = WrappedKey::from_bytes(vec![0u8; WRAPPED_KEY_SIZE]).unwrap();
        assert!(matches!(
            unwrap_key(&forged, &member),
            Err(Error::KeyUnwrapError(_))
        ));
    }

    #[test]
    fn test_serde_base64_form() {
        let member = IdentityKeyPair::generate();
        let wrapped = wrap_key(&ConversationKey::generate(), &member.public_key()).unwrap();
        let json = serde_json::to_string(&wrapped).unwrap();
        assert!(json.starts_with('"'));
        let back: WrappedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wrapped);
    }
}
