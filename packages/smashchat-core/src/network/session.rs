//! # Realtime Session
//!
//! Client side of the realtime protocol. One [`RealtimeSession`] owns one
//! WebSocket connection; there is no global instance.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SESSION TASKS                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   RealtimeSession ──ClientCommand──► mpsc ──► writer task ──► ws sink   │
//! │                                                                         │
//! │   ws stream ──► reader task ──ServerEvent──► decrypt ──► SessionEvent   │
//! │                                                        │                │
//! │                                                        ▼                │
//! │                                              mpsc::Receiver (caller)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Incoming `new_message` frames are opened with the vault's conversation
//! key. A message that cannot be opened arrives as
//! [`MessageContent::Unavailable`]; the session keeps running.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::protocol::{ClientCommand, MessageRecord, MessageType, ServerEvent, SessionStatus};
use crate::error::{Error, Result};
use crate::messaging::{open_content, MessageContent, SealedMessage};
use crate::vault::KeyVault;

/// Outbound command queue depth
const OUTBOUND_BUFFER: usize = 256;

/// Connection settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws`
    pub server_url: String,
    /// Session token from the REST login
    pub token: String,
    /// Inbound event queue depth
    pub event_buffer: usize,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            token: String::new(),
            event_buffer: 256,
        }
    }
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Authenticated {
        user_id: String,
    },
    Joined {
        conversation_id: String,
    },
    Left {
        conversation_id: String,
    },
    Message {
        message: MessageRecord,
        content: MessageContent,
    },
    Typing {
        conversation_id: String,
        user_id: String,
        user_name: String,
        is_typing: bool,
    },
    Read {
        conversation_id: String,
        message_id: String,
        user_id: String,
        user_name: String,
    },
    KeySet,
    Error {
        message: String,
        conversation_id: Option<String>,
    },
    Pong,
    /// The connection is gone; no further events follow
    Disconnected,
}

/// A live realtime connection
pub struct RealtimeSession {
    user_id: String,
    vault: Arc<KeyVault>,
    outbound: mpsc::Sender<ClientCommand>,
    status: Arc<RwLock<SessionStatus>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RealtimeSession {
    /// Open the socket and start the reader/writer tasks.
    ///
    /// The token travels in the `Authorization: Bearer` header. Whether it
    /// was accepted shows up as the first event: `Authenticated` or `Error`.
    pub async fn connect(
        config: SessionConfig,
        vault: Arc<KeyVault>,
        user_id: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let user_id = user_id.into();
        let status = Arc::new(RwLock::new(SessionStatus::Connecting));

        let mut request = config.server_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| Error::AuthenticationError("Token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request).await.map_err(|e| {
            *status.write() = SessionStatus::Error(e.to_string());
            Error::from(e)
        })?;
        *status.write() = SessionStatus::Connected;
        tracing::info!(user_id = %user_id, url = %config.server_url, "Realtime session connected");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientCommand>(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(config.event_buffer.max(1));

        let writer = tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match serde_json::to_string(&cmd) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize command: {}", e);
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_vault = vault.clone();
        let reader_status = status.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let event = match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(error = %e, "Unparseable server frame");
                                continue;
                            }
                        };
                        let event = translate(event, &reader_vault, &reader_status);
                        if event_tx.send(event).await.is_err() {
                            // Receiver dropped
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Realtime socket error");
                        *reader_status.write() = SessionStatus::Error(e.to_string());
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut status = reader_status.write();
                if !matches!(*status, SessionStatus::Error(_)) {
                    *status = SessionStatus::Disconnected;
                }
            }
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok((
            Self {
                user_id,
                vault,
                outbound: out_tx,
                status,
                writer,
                reader,
            },
            event_rx,
        ))
    }

    /// Current connection status
    pub fn status(&self) -> SessionStatus {
        self.status.read().clone()
    }

    /// The user this session belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a raw command
    pub async fn send(&self, command: ClientCommand) -> Result<()> {
        self.outbound
            .send(command)
            .await
            .map_err(|_| Error::NotConnected)
    }

    pub async fn join(&self, conversation_id: &str) -> Result<()> {
        self.send(ClientCommand::JoinChat {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn leave(&self, conversation_id: &str) -> Result<()> {
        self.send(ClientCommand::LeaveChat {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    /// Encrypt `text` with the newest local conversation key and send it
    pub async fn send_text(
        &self,
        conversation_id: &str,
        text: &str,
        reply_to_id: Option<String>,
    ) -> Result<()> {
        let (version, key) = self.vault.latest_conversation_key(conversation_id)?;
        let sealed = SealedMessage::seal(text, &key, version, conversation_id)?;

        self.send(ClientCommand::SendMessage {
            conversation_id: conversation_id.to_string(),
            encrypted_content: sealed.to_json()?,
            message_type: MessageType::Text,
            reply_to_id,
        })
        .await
    }

    pub async fn start_typing(&self, conversation_id: &str) -> Result<()> {
        self.send(ClientCommand::TypingStart {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn stop_typing(&self, conversation_id: &str) -> Result<()> {
        self.send(ClientCommand::TypingStop {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn mark_read(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.send(ClientCommand::MarkRead {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    /// Publish this user's identity public key
    pub async fn publish_public_key(&self) -> Result<()> {
        let public = self.vault.public_key(&self.user_id)?;
        self.send(ClientCommand::SetPublicKey {
            public_key: public.to_armored(),
        })
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(ClientCommand::Ping).await
    }

    /// Flush queued commands, close the socket and stop both tasks
    pub async fn disconnect(self) {
        let Self {
            outbound,
            status,
            writer,
            reader,
            user_id,
            ..
        } = self;

        drop(outbound);
        let _ = writer.await;
        reader.abort();
        *status.write() = SessionStatus::Disconnected;
        tracing::info!(user_id = %user_id, "Realtime session closed");
    }
}

fn translate(
    event: ServerEvent,
    vault: &KeyVault,
    status: &RwLock<SessionStatus>,
) -> SessionEvent {
    match event {
        ServerEvent::Authenticated { user_id } => {
            *status.write() = SessionStatus::Authenticated;
            SessionEvent::Authenticated { user_id }
        }
        ServerEvent::Joined { conversation_id } => SessionEvent::Joined { conversation_id },
        ServerEvent::Left { conversation_id } => SessionEvent::Left { conversation_id },
        ServerEvent::NewMessage { message } => {
            let content = open_content(vault, &message.conversation_id, &message.encrypted_content);
            SessionEvent::Message { message, content }
        }
        ServerEvent::UserTyping {
            conversation_id,
            user_id,
            user_name,
            is_typing,
        } => SessionEvent::Typing {
            conversation_id,
            user_id,
            user_name,
            is_typing,
        },
        ServerEvent::MessageRead {
            conversation_id,
            message_id,
            user_id,
            user_name,
        } => SessionEvent::Read {
            conversation_id,
            message_id,
            user_id,
            user_name,
        },
        ServerEvent::KeySetSuccess => SessionEvent::KeySet,
        ServerEvent::Error {
            message,
            conversation_id,
        } => {
            if conversation_id.is_none() && message.starts_with("Authentication error") {
                *status.write() = SessionStatus::Error(message.clone());
            }
            SessionEvent::Error {
                message,
                conversation_id,
            }
        }
        ServerEvent::Pong => SessionEvent::Pong,
    }
}
