//! # Key Derivation Functions
//!
//! HKDF-SHA256 derivations used by key wrapping and local key storage.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 SHARED SECRET → WRAPPING KEY                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ephemeral_secret × recipient_public = X25519 shared secret (32 bytes)  │
//! │                                │                                        │
//! │                                ▼                                        │
//! │  HKDF-SHA256(                                                          │
//! │    ikm  = shared_secret,                                               │
//! │    salt = ephemeral_public ║ recipient_public,  ← binds both parties   │
//! │    info = "smash-key-wrap-v1"                                          │
//! │  )                                                                     │
//! │                                │                                        │
//! │                                ▼                                        │
//! │                  32-byte AES-256-GCM wrapping key                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::encryption::{EncryptionKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Domain separation strings for HKDF
pub mod domain {
    /// Wrapping a conversation key for one member
    pub const KEY_WRAP: &[u8] = b"smash-key-wrap-v1";

    /// Encrypting the local key store at rest
    pub const STORAGE_ENCRYPTION: &[u8] = b"smash-storage-key-v1";
}

/// Derive the AES key that wraps one conversation key copy
pub fn derive_wrapping_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<EncryptionKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(domain::KEY_WRAP, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("Failed to derive wrapping key".into()))?;

    let derived = EncryptionKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

/// Derive the key-store encryption key from device secret material.
///
/// `context` separates independent stores on the same device.
pub fn derive_storage_key(secret: &[u8], context: &[u8]) -> Result<EncryptionKey> {
    if secret.len() < 16 {
        return Err(Error::KeyDerivationFailed(
            "Storage secret must be at least 16 bytes".into(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(context), secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(domain::STORAGE_ENCRYPTION, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("Failed to derive storage key".into()))?;

    let derived = EncryptionKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

// ============================================================================
// TESTS
// ============================================================================
