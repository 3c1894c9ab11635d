//! # Identity Keys
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  IdentityKeyPair (X25519)                                       │   │
//! │  │  ─────────────────────────                                       │   │
//! │  │                                                                  │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Receiving wrapped conversation keys                          │   │
//! │  │                                                                  │   │
//! │  │  Format:                                                        │   │
//! │  │  • Private key: 32 bytes (never leaves the client, zeroized)    │   │
//! │  │  • Public key: 32 bytes (published to the server, armored)      │   │
//! │  │                                                                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Armored form:                                                         │
//! │                                                                         │
//! │    -----BEGIN SMASH PUBLIC KEY-----                                     │
//! │    <base64 of the 32 public key bytes>                                  │
//! │    -----END SMASH PUBLIC KEY-----                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

const ARMOR_BEGIN: &str = "-----BEGIN SMASH PUBLIC KEY-----";
const ARMOR_END: &str = "-----END SMASH PUBLIC KEY-----";

/// Per-user asymmetric keypair
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random keypair from the OS RNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore from stored secret bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("Identity secret must be 32 bytes".into()))?;
        let secret = StaticSecret::from(array);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Secret key bytes, for the key store only. Never log these.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// The shareable half
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public.to_bytes())
    }

    /// X25519 with a peer's public key
    pub(crate) fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(their_public.0))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

/// A user's public key, safe to share and store anywhere
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes")] pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// PEM-style text form
    pub fn to_armored(&self) -> String {
        format!("{}\n{}\n{}", ARMOR_BEGIN, STANDARD.encode(self.0), ARMOR_END)
    }

    /// Parse the text form produced by [`PublicKey::to_armored`].
    ///
    /// Surrounding whitespace and line breaks inside the body are tolerated.
    pub fn from_armored(text: &str) -> Result<Self> {
        let body = text
            .trim()
            .strip_prefix(ARMOR_BEGIN)
            .and_then(|rest| rest.trim_end().strip_suffix(ARMOR_END))
            .ok_or_else(|| Error::InvalidKey("Missing public key armor".into()))?;

        let encoded: String = body.split_whitespace().collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidKey(format!("Invalid public key encoding: {}", e)))?;

        let array: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("Public key must be 32 bytes".into()))?;
        Ok(Self(array))
    }

    /// Short, log-safe identifier: first 8 bytes of SHA-256, hex
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.0);
        hex::encode(&hash[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// Serde helper for serializing byte arrays as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
