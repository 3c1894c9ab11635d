//! # Cryptography Module
//!
//! Stateless primitives behind end-to-end encrypted conversations. Every
//! function here is pure apart from drawing randomness, so all of it is safe
//! to call from any number of threads at once.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    KEY HIERARCHY                                │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  IdentityKeyPair (X25519, per user, client only)                │   │
//! │  │          │                                                      │   │
//! │  │          │ unwraps                                              │   │
//! │  │          ▼                                                      │   │
//! │  │  WrappedKey (one per member per version, stored by server)      │   │
//! │  │          │                                                      │   │
//! │  │          ▼                                                      │   │
//! │  │  ConversationKey (AES-256, per conversation version)            │   │
//! │  │          │                                                      │   │
//! │  │          │ encrypts                                             │   │
//! │  │          ▼                                                      │   │
//! │  │  EncryptedPayload (one per message)                             │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | X25519 | Identity keys, ephemeral key agreement for wrapping |
//! | HKDF-SHA256 | Wrapping and storage key derivation |
//! | AES-256-GCM | Payloads, wrapped keys, key store at rest |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: All secret keys are zeroized when dropped
//! 2. **Secure Random**: `rand::rngs::OsRng` for keys and nonces
//! 3. **No Nonce Reuse**: a fresh random nonce for every encryption
//! 4. **Contributory DH**: wrapping refuses low-order public keys

mod encryption;
mod kdf;
mod keys;
mod wrap;

pub use encryption::{
    decrypt, decrypt_payload, encrypt, encrypt_payload, ConversationKey, EncryptedPayload,
    EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use kdf::{derive_storage_key, derive_wrapping_key};
pub use keys::{IdentityKeyPair, PublicKey, PUBLIC_KEY_SIZE};
pub use wrap::{unwrap_key, wrap_key, WrappedKey, WRAPPED_KEY_SIZE};
