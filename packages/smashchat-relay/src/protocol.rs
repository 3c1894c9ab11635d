//! Relay protocol message definitions.
//!
//! The relay speaks the same JSON-over-WebSocket protocol as the client
//! library, so the frame types are shared from `smashchat_core`. All message
//! payloads are opaque to the relay; E2E encryption happens client-side.

use axum::extract::ws::Message;
use tokio::sync::mpsc;

pub use smashchat_core::network::protocol::{
    ClientCommand, MessageRecord, MessageType, ServerEvent,
};

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

/// Encode an event as a WebSocket text frame.
pub fn to_frame(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::error!("Failed to serialize server event: {}", e);
            None
        }
    }
}

/// Parse an inbound text frame.
pub fn parse_command(text: &str) -> Result<ClientCommand, String> {
    serde_json::from_str(text).map_err(|e| format!("Invalid message format: {}", e))
}
