//! # Messaging Module
//!
//! Sealed message envelopes: the opaque `encryptedContent` carried by the
//! realtime protocol and stored by the server.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SEALED MESSAGE FORMAT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SealedMessage (JSON serialized)                                       │
//! │  ───────────────────────────────                                        │
//! │  {                                                                      │
//! │    "version": 1,             // Envelope format version                 │
//! │    "keyVersion": 3,          // Conversation key version used           │
//! │    "nonce": "base64...",     // 12-byte nonce                           │
//! │    "ciphertext": "base64...",// AES-256-GCM ciphertext                  │
//! │    "tag": "base64..."        // 16-byte authentication tag              │
//! │  }                                                                      │
//! │                                                                         │
//! │  AAD = conversation id, so an envelope replayed into another           │
//! │  conversation fails to open.                                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server never opens an envelope; it only checks the shape with
//! [`SealedMessage::parse`] before persisting it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    decrypt_payload, encrypt_payload, ConversationKey, EncryptedPayload, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::vault::KeyVault;

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Maximum plaintext size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encrypted message envelope for wire transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMessage {
    /// Envelope format version
    pub version: u8,
    /// Conversation key version that encrypted this message
    pub key_version: u32,
    /// AES-GCM nonce (base64)
    pub nonce: String,
    /// Ciphertext (base64)
    pub ciphertext: String,
    /// Authentication tag (base64)
    pub tag: String,
}

impl SealedMessage {
    /// Encrypt `plaintext` for a conversation
    pub fn seal(
        plaintext: &str,
        key: &ConversationKey,
        key_version: u32,
        conversation_id: &str,
    ) -> Result<Self> {
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(Error::FormatError(format!(
                "Message too large: {} bytes (max {})",
                plaintext.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let payload = encrypt_payload(plaintext.as_bytes(), key, conversation_id.as_bytes())?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            key_version,
            nonce: BASE64.encode(payload.nonce),
            ciphertext: BASE64.encode(&payload.ciphertext),
            tag: BASE64.encode(payload.auth_tag),
        })
    }

    /// Decrypt with the key version named in the envelope
    pub fn open(&self, key: &ConversationKey, conversation_id: &str) -> Result<String> {
        let payload = self.payload()?;
        let plaintext = decrypt_payload(&payload, key, conversation_id.as_bytes())?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::DeserializationError("Message is not valid UTF-8".into()))
    }

    /// Parse and shape-check a wire envelope without decrypting it
    pub fn parse(json: &str) -> Result<Self> {
        let sealed: SealedMessage = serde_json::from_str(json)
            .map_err(|e| Error::FormatError(format!("Malformed envelope: {}", e)))?;
        sealed
            .payload()
            .map_err(|e| Error::FormatError(format!("Malformed envelope: {}", e)))?;
        Ok(sealed)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    fn payload(&self) -> Result<EncryptedPayload> {
        if self.version != ENVELOPE_VERSION {
            return Err(Error::ProtocolError(format!(
                "Unsupported envelope version: {} (expected {})",
                self.version, ENVELOPE_VERSION
            )));
        }

        let nonce: [u8; NONCE_SIZE] = BASE64
            .decode(&self.nonce)?
            .try_into()
            .map_err(|_| Error::DeserializationError("Invalid nonce length".into()))?;
        let auth_tag: [u8; TAG_SIZE] = BASE64
            .decode(&self.tag)?
            .try_into()
            .map_err(|_| Error::DeserializationError("Invalid tag length".into()))?;
        let ciphertext = BASE64.decode(&self.ciphertext)?;

        Ok(EncryptedPayload {
            ciphertext,
            nonce,
            auth_tag,
        })
    }
}

/// Decrypted view of a received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text
    Text { text: String },
    /// Could not be decrypted; shown as "message unavailable"
    Unavailable { reason: String },
}

impl MessageContent {
    /// Text content, if available
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            MessageContent::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, MessageContent::Text { .. })
    }
}

/// Open a wire envelope with the vault's keys.
///
/// Never fails: a missing key, a malformed envelope or a tag mismatch all
/// become [`MessageContent::Unavailable`] so one bad message cannot break a
/// conversation.
pub fn open_content(vault: &KeyVault, conversation_id: &str, encrypted_content: &str) -> MessageContent {
    let result = SealedMessage::parse(encrypted_content).and_then(|sealed| {
        let key = vault.conversation_key(conversation_id, sealed.key_version)?;
        sealed.open(&key, conversation_id)
    });

    match result {
        Ok(text) => MessageContent::Text { text },
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                code = e.code(),
                "Message unavailable"
            );
            MessageContent::Unavailable {
                reason: e.to_string(),
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyStore;
    use std::sync::Arc;

    #[test]
    fn test_seal_open_round_trip() {
        let key = ConversationKey::generate();
        let sealed = SealedMessage::seal("hello", &key, 1, "conv-1").unwrap();
        assert_eq!(sealed.open(&key, "conv-1").unwrap(), "hello");
    }

    #[test]
    fn test_open_in_other_conversation_fails() {
        let key = ConversationKey::generate();
        let sealed = SealedMessage::seal("hello", &key, 1, "conv-1").unwrap();
        assert!(matches!(
            sealed.open(&key, "conv-2"),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_json_shape() {
        let key = ConversationKey::generate();
        let json = SealedMessage::seal("x", &key, 7, "c").unwrap().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["keyVersion"], 7);
        assert!(value["tag"].is_string());

        let parsed = SealedMessage::parse(&json).unwrap();
        assert_eq!(parsed.open(&key, "c").unwrap(), "x");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(
            SealedMessage::parse("plain text"),
            Err(Error::FormatError(_))
        ));
        let short_nonce = r#"{"version":1,"keyVersion":1,"nonce":"AAAA","ciphertext":"","tag":"AAAAAAAAAAAAAAAAAAAAAA=="}"#;
        assert!(matches!(
            SealedMessage::parse(short_nonce),
            Err(Error::FormatError(_))
        ));
        let future = r#"{"version":9,"keyVersion":1,"nonce":"AAAAAAAAAAAAAAAA","ciphertext":"","tag":"AAAAAAAAAAAAAAAAAAAAAA=="}"#;
        assert!(matches!(SealedMessage::parse(future), Err(Error::FormatError(_))));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let key = ConversationKey::generate();
        let big = "a".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            SealedMessage::seal(&big, &key, 1, "c"),
            Err(Error::FormatError(_))
        ));
    }

    #[test]
    fn test_open_content_degrades_gracefully() {
        let vault = KeyVault::new(Arc::new(MemoryKeyStore::new()));
        let me = vault.generate_identity("alice").unwrap();
        vault
            .create_conversation_key("c", &[("alice".into(), me)])
            .unwrap();
        let (version, key) = vault.latest_conversation_key("c").unwrap();

        let good = SealedMessage::seal("hi", &key, version, "c").unwrap().to_json().unwrap();
        assert_eq!(open_content(&vault, "c", &good).as_text(), Some("hi"));

        // Unknown key version
        let other = ConversationKey::generate();
        let unknown = SealedMessage::seal("hi", &other, 99, "c").unwrap().to_json().unwrap();
        assert!(!open_content(&vault, "c", &unknown).is_available());

        // Right version, wrong key
        let forged = SealedMessage::seal("hi", &other, version, "c").unwrap().to_json().unwrap();
        assert!(!open_content(&vault, "c", &forged).is_available());

        assert!(!open_content(&vault, "c", "garbage").is_available());
    }
}
