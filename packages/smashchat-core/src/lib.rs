//! # SmashChat Core
//!
//! Client and shared library for SmashChat: SMASH pattern authentication,
//! typing-dynamics profiling, and end-to-end encrypted conversations over a
//! realtime relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SMASHCHAT CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │   Pattern   │  │   Typing    │  │    Vault    │  │   Messaging  │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Normalize │  │ - Profile   │  │ - Identity  │  │ - Seal       │   │
//! │  │ - Digest    │  │ - Blend     │  │ - Conv keys │  │ - Open       │   │
//! │  │ - Lockout   │  │ - Score     │  │ - Wrap      │  │ - Degrade    │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴────────────────┴────────────────┘           │
//! │                                   │                                     │
//! │  ┌─────────────┐  ┌─────────────┐ │ ┌─────────────────────────────────┐│
//! │  │   Crypto    │  │   Storage   │ │ │           Network               ││
//! │  │             │  │             │ │ │                                 ││
//! │  │ - X25519    │  │ - KeyStore  │◄┘ │ - Realtime protocol frames     ││
//! │  │ - AES-GCM   │  │ - Encrypted │   │ - WebSocket session            ││
//! │  │ - HKDF      │  │ - File      │   │                                 ││
//! │  └─────────────┘  └─────────────┘   └─────────────────────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`pattern`] - SMASH pattern normalization, digests and lockout
//! - [`typing`] - Keystroke timing profiles
//! - [`crypto`] - Cryptographic primitives (keys, encryption, wrapping)
//! - [`storage`] - Client-side key storage
//! - [`vault`] - Identity and conversation key management
//! - [`messaging`] - Sealed message envelopes
//! - [`network`] - Realtime protocol and WebSocket session
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Pattern Authentication                                       │
//! │  ───────────────────────────────                                        │
//! │  The server keeps only a salted PBKDF2 digest of the normalized        │
//! │  pattern. Failed attempts are counted atomically and lock the          │
//! │  account for a fixed window.                                           │
//! │                                                                         │
//! │  Layer 2: Message-Level E2E Encryption (AES-256-GCM)                   │
//! │  ─────────────────────────────────────────────────────                  │
//! │  Every conversation has a symmetric key. The relay stores and          │
//! │  forwards ciphertext only.                                             │
//! │                                                                         │
//! │  Layer 3: Key Distribution (X25519 + HKDF)                              │
//! │  ──────────────────────────────────────────                             │
//! │  Each member receives the conversation key wrapped to their            │
//! │  identity public key. The relay cannot unwrap it.                      │
//! │                                                                         │
//! │  Layer 4: Local Key Storage (AES-256-GCM)                              │
//! │  ─────────────────────────────────────────                              │
//! │  Secret keys at rest are encrypted with a storage key.                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod crypto;
pub mod error;
pub mod messaging;
pub mod network;
pub mod pattern;
pub mod storage;
pub mod time;
pub mod typing;
pub mod vault;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use crypto::{ConversationKey, IdentityKeyPair, PublicKey, WrappedKey};
pub use error::{Error, Result};
pub use messaging::{MessageContent, SealedMessage};
pub use network::{ClientCommand, MessageRecord, RealtimeSession, ServerEvent, SessionEvent};
pub use pattern::{AccountProgress, PatternVerifier, SmashCredential};
pub use typing::{KeyEvent, TypingProfile, TypingProfiler};
pub use vault::KeyVault;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of SmashChat Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}
