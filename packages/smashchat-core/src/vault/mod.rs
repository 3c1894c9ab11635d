//! # Key Vault
//!
//! Client-side key lifecycle on top of a [`KeyStore`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  CONVERSATION KEY DISTRIBUTION                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Creator                                                               │
//! │  ───────                                                                │
//! │  1. version = latest + 1                                               │
//! │  2. key = ConversationKey::generate()                                  │
//! │  3. for each member: wrap_key(key, member.public_key)                  │
//! │  4. store key locally, upload one copy per member                      │
//! │                                                                         │
//! │  Member                                                                │
//! │  ──────                                                                 │
//! │  1. fetch own MemberKeyCopy                                            │
//! │  2. unwrap_key(copy, own identity)                                     │
//! │  3. store key locally under the same version                          │
//! │                                                                         │
//! │  The server only ever sees wrapped copies and public keys.            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{unwrap_key, wrap_key, ConversationKey, IdentityKeyPair, PublicKey, WrappedKey};
use crate::error::{Error, Result};
use crate::storage::{ids, KeyStore};

/// One member's wrapped copy of a conversation key version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberKeyCopy {
    pub member_id: String,
    pub version: u32,
    pub wrapped: WrappedKey,
}

/// Everything the server needs to hand out a new conversation key version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDistribution {
    pub conversation_id: String,
    pub version: u32,
    pub copies: Vec<MemberKeyCopy>,
}

/// Owns identity and conversation keys for the local device
pub struct KeyVault {
    store: Arc<dyn KeyStore>,
}

impl KeyVault {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    /// Create the identity keypair for `user_id`.
    ///
    /// Idempotent: an existing identity is kept and its public key returned.
    /// Use [`KeyVault::rotate_identity`] to replace it.
    pub fn generate_identity(&self, user_id: &str) -> Result<PublicKey> {
        if let Some(existing) = self.load_identity(user_id)? {
            return Ok(existing.public_key());
        }
        self.store_new_identity(user_id)
    }

    /// Replace the identity keypair; the old secret is discarded.
    ///
    /// Copies wrapped for the old public key can no longer be imported.
    pub fn rotate_identity(&self, user_id: &str) -> Result<PublicKey> {
        let public = self.store_new_identity(user_id)?;
        tracing::info!(user_id = %user_id, fingerprint = %public.fingerprint(), "Identity rotated");
        Ok(public)
    }

    /// Load the identity keypair
    pub fn identity(&self, user_id: &str) -> Result<IdentityKeyPair> {
        self.load_identity(user_id)?
            .ok_or_else(|| Error::NoIdentity(user_id.to_string()))
    }

    /// Public half of the identity
    pub fn public_key(&self, user_id: &str) -> Result<PublicKey> {
        Ok(self.identity(user_id)?.public_key())
    }

    fn store_new_identity(&self, user_id: &str) -> Result<PublicKey> {
        let keypair = IdentityKeyPair::generate();
        self.store
            .put(&ids::identity(user_id), &*keypair.secret_bytes())?;
        Ok(keypair.public_key())
    }

    fn load_identity(&self, user_id: &str) -> Result<Option<IdentityKeyPair>> {
        match self.store.get(&ids::identity(user_id))? {
            Some(secret) => Ok(Some(IdentityKeyPair::from_secret_bytes(&secret).map_err(
                |_| Error::StorageCorrupted(format!("Identity for {} is malformed", user_id)),
            )?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // CONVERSATION KEYS
    // ========================================================================

    /// Generate the next key version for a conversation and wrap it for
    /// every member.
    ///
    /// Nothing is stored if any member's public key is unusable.
    pub fn create_conversation_key(
        &self,
        conversation_id: &str,
        members: &[(String, PublicKey)],
    ) -> Result<KeyDistribution> {
        let version = self.latest_version(conversation_id)?.unwrap_or(0) + 1;
        let key = ConversationKey::generate();

        let copies = members
            .iter()
            .map(|(member_id, public)| {
                Ok(MemberKeyCopy {
                    member_id: member_id.clone(),
                    version,
                    wrapped: wrap_key(&key, public)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.store
            .put(&ids::conversation(conversation_id, version), key.as_bytes())?;

        tracing::debug!(
            conversation_id = %conversation_id,
            version,
            members = copies.len(),
            "Conversation key created"
        );

        Ok(KeyDistribution {
            conversation_id: conversation_id.to_string(),
            version,
            copies,
        })
    }

    /// Unwrap a received copy with `user_id`'s identity and store it.
    pub fn import_conversation_key(
        &self,
        user_id: &str,
        conversation_id: &str,
        copy: &MemberKeyCopy,
    ) -> Result<u32> {
        if copy.member_id != user_id {
            return Err(Error::KeyUnwrapError(format!(
                "Key copy belongs to {}",
                copy.member_id
            )));
        }

        let identity = self.identity(user_id)?;
        let key = unwrap_key(&copy.wrapped, &identity)?;
        self.store
            .put(&ids::conversation(conversation_id, copy.version), key.as_bytes())?;

        tracing::debug!(
            conversation_id = %conversation_id,
            version = copy.version,
            "Conversation key imported"
        );
        Ok(copy.version)
    }

    /// A specific key version
    pub fn conversation_key(&self, conversation_id: &str, version: u32) -> Result<ConversationKey> {
        let raw = self
            .store
            .get(&ids::conversation(conversation_id, version))?
            .ok_or_else(|| Error::ConversationKeyMissing {
                conversation_id: conversation_id.to_string(),
                version: Some(version),
            })?;
        ConversationKey::from_slice(&raw).map_err(|_| {
            Error::StorageCorrupted(format!(
                "Key {} v{} is malformed",
                conversation_id, version
            ))
        })
    }

    /// The newest key version held locally
    pub fn latest_conversation_key(&self, conversation_id: &str) -> Result<(u32, ConversationKey)> {
        let version = self
            .latest_version(conversation_id)?
            .ok_or_else(|| Error::ConversationKeyMissing {
                conversation_id: conversation_id.to_string(),
                version: None,
            })?;
        Ok((version, self.conversation_key(conversation_id, version)?))
    }

    /// Highest locally held version, if any
    pub fn latest_version(&self, conversation_id: &str) -> Result<Option<u32>> {
        Ok(self
            .store
            .list(&ids::conversation_prefix(conversation_id))?
            .iter()
            .filter_map(|id| ids::conversation_version(conversation_id, id))
            .max())
    }

    /// Drop every local key version of a conversation
    pub fn forget_conversation(&self, conversation_id: &str) -> Result<usize> {
        let mut removed = 0;
        for id in self.store.list(&ids::conversation_prefix(conversation_id))? {
            if ids::conversation_version(conversation_id, &id).is_some() && self.store.delete(&id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
