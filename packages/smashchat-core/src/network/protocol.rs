//! # Realtime Protocol
//!
//! JSON frames exchanged over the WebSocket between clients and the relay.
//! Both enums are closed; an unknown `type` is a protocol error.
//!
//! Variant tags are snake_case (`send_message`); payload fields are
//! camelCase (`conversationId`, `encryptedContent`).
//!
//! All `encryptedContent` values are opaque [`SealedMessage`] JSON; the
//! relay never sees plaintext.
//!
//! [`SealedMessage`]: crate::messaging::SealedMessage

use serde::{Deserialize, Serialize};

/// Kind of chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    JoinChat {
        conversation_id: String,
    },
    LeaveChat {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        encrypted_content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    MarkRead {
        conversation_id: String,
        message_id: String,
    },
    SetPublicKey {
        public_key: String,
    },
    Ping,
}

/// A persisted message as broadcast to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub encrypted_content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Per-conversation persistence order, starting at 1
    pub sequence: u64,
    /// Unix timestamp (milliseconds)
    pub created_at: i64,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user_id: String,
    },
    Joined {
        conversation_id: String,
    },
    Left {
        conversation_id: String,
    },
    NewMessage {
        message: MessageRecord,
    },
    UserTyping {
        conversation_id: String,
        user_id: String,
        user_name: String,
        is_typing: bool,
    },
    MessageRead {
        conversation_id: String,
        message_id: String,
        user_id: String,
        user_name: String,
    },
    KeySetSuccess,
    Error {
        message: String,
        /// Set when the error concerns one conversation only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Pong,
}

impl ServerEvent {
    /// Error frame not tied to a conversation
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            conversation_id: None,
        }
    }

    /// Error frame scoped to one conversation
    pub fn scoped_error(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            conversation_id: Some(conversation_id.into()),
        }
    }
}

/// Session connection status.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error(String),
}
