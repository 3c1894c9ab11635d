//! # Storage Module
//!
//! Client-side persistence for secret key material.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  KeyStore (keys only)                                           │   │
//! │  │  ────────────────────                                            │   │
//! │  │                                                                 │   │
//! │  │  smash.identity.{user}                 identity secret          │   │
//! │  │  smash.conversation.{conv}.v{n}        conversation key v{n}    │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Messages, users and wrapped key copies live on the server; the        │
//! │  client only ever persists what it needs to decrypt.                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod key_store;

pub use key_store::{ids, EncryptedKeyStore, FileKeyStore, KeyStore, MemoryKeyStore};
