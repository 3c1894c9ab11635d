//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: authenticating the upgrade,
//! parsing client commands, routing them through the relay state, and
//! sending responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use smashchat_core::Error;
use tokio::sync::mpsc;

use crate::protocol::{parse_command, to_frame, ClientCommand, ServerEvent};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Verifies the bearer token captured at upgrade time
/// 2. Registers the connection and joins it to the user's conversations
/// 3. Spawns a sender task to forward outbound events
/// 4. Processes incoming commands until the connection closes
pub async fn handle_websocket(socket: WebSocket, state: RelayState, token: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Authenticate ──────────────────────────────────────────────

    let auth = match token.as_deref() {
        Some(token) => state.authenticate(token),
        None => Err(Error::AuthenticationError("Missing token".into())),
    };

    let user = match auth {
        Ok((_, user)) => user,
        Err(e) => {
            let message = match e {
                Error::AuthenticationError(_) => e.to_string(),
                other => format!("Authentication error: {}", other),
            };
            tracing::warn!(reason = %message, "Rejected socket");
            if let Some(frame) = to_frame(&ServerEvent::error(message)) {
                let _ = ws_sender.send(frame).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    // ── Step 2: Register Connection ───────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let _ = tx.send(ServerEvent::Authenticated {
        user_id: user.id.clone(),
    });

    let connection_id = state.register_connection(&user, tx.clone());
    for conversation_id in state.auto_join(&connection_id, &user.id) {
        let _ = tx.send(ServerEvent::Joined { conversation_id });
    }
    drop(tx);

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(frame) = to_frame(&event) {
                if ws_sender.send(frame).await.is_err() {
                    break; // Connection closed
                }
            }
        }
    });

    // ── Step 4: Process Commands ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match parse_command(&text) {
                Ok(command) => handle_command(&state, &connection_id, &user.id, command),
                Err(message) => {
                    tracing::warn!(user_id = %user.id, error = %message, "Malformed frame");
                    state.send_to_connection(&connection_id, ServerEvent::error(message));
                }
            },
            Ok(Message::Close(_)) => {
                tracing::debug!(user_id = %user.id, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong: axum answers pings itself
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    state.unregister_connection(&connection_id);
    sender_task.abort();
    tracing::info!(user_id = %user.id, "WebSocket disconnected");
}

/// Handle a parsed client command.
fn handle_command(state: &RelayState, connection_id: &str, user_id: &str, command: ClientCommand) {
    match command {
        ClientCommand::JoinChat { conversation_id } => {
            match state.join_room(&conversation_id, connection_id, user_id) {
                Ok(()) => {
                    state.send_to_connection(connection_id, ServerEvent::Joined { conversation_id });
                }
                Err(e) => reply_error(state, connection_id, &conversation_id, e),
            }
        }

        ClientCommand::LeaveChat { conversation_id } => {
            state.leave_room(&conversation_id, connection_id);
            state.send_to_connection(connection_id, ServerEvent::Left { conversation_id });
        }

        ClientCommand::SendMessage {
            conversation_id,
            encrypted_content,
            message_type,
            reply_to_id,
        } => {
            if let Err(e) = state.send_message(
                connection_id,
                &conversation_id,
                encrypted_content,
                message_type,
                reply_to_id,
            ) {
                reply_error(state, connection_id, &conversation_id, e);
            }
        }

        ClientCommand::TypingStart { conversation_id } => {
            if let Err(e) = state.relay_typing(connection_id, &conversation_id, true) {
                reply_error(state, connection_id, &conversation_id, e);
            }
        }

        ClientCommand::TypingStop { conversation_id } => {
            if let Err(e) = state.relay_typing(connection_id, &conversation_id, false) {
                reply_error(state, connection_id, &conversation_id, e);
            }
        }

        ClientCommand::MarkRead {
            conversation_id,
            message_id,
        } => {
            if let Err(e) = state.relay_read(connection_id, &conversation_id, &message_id) {
                reply_error(state, connection_id, &conversation_id, e);
            }
        }

        ClientCommand::SetPublicKey { public_key } => {
            match state.set_public_key(user_id, &public_key) {
                Ok(_) => {
                    state.send_to_connection(connection_id, ServerEvent::KeySetSuccess);
                }
                Err(e) => {
                    state.send_to_connection(connection_id, ServerEvent::error(e.to_string()));
                }
            }
        }

        ClientCommand::Ping => {
            state.send_to_connection(connection_id, ServerEvent::Pong);
        }
    }
}

fn reply_error(state: &RelayState, connection_id: &str, conversation_id: &str, err: Error) {
    tracing::warn!(
        conversation_id = %conversation_id,
        code = err.code(),
        "Command rejected: {}",
        err
    );
    state.send_to_connection(
        connection_id,
        ServerEvent::scoped_error(conversation_id, err.to_string()),
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use smashchat_core::network::{RealtimeSession, SessionConfig, SessionEvent};
    use smashchat_core::storage::MemoryKeyStore;
    use smashchat_core::vault::KeyVault;
    use smashchat_core::{MessageContent, SealedMessage};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::state::{RelayConfig, RelayState};
    use crate::testing::spawn_server;

    use super::*;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Fixture {
        state: RelayState,
        url: String,
        alice: (String, String),
        bob: (String, String),
        mallory: (String, String),
        conversation_id: String,
    }

    fn user(state: &RelayState, email: &str, name: &str) -> (String, String) {
        let user = state.store.create_user(email, name, None, 0).unwrap();
        let (token, _) = state.issue_token(&user.id).unwrap();
        (user.id, token)
    }

    async fn fixture() -> Fixture {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        let alice = user(&state, "alice@example.com", "Alice");
        let bob = user(&state, "bob@example.com", "Bob");
        let mallory = user(&state, "mallory@example.com", "Mallory");
        let (conversation, _) =
            state
                .store
                .create_conversation(None, &alice.0, vec![bob.0.clone()], 0);

        let addr = spawn_server(state.clone()).await;
        Fixture {
            state,
            url: format!("ws://{}/ws", addr),
            alice,
            bob,
            mallory,
            conversation_id: conversation.id,
        }
    }

    async fn open(url: &str, token: Option<&str>) -> Socket {
        let url = match token {
            Some(t) => format!("{}?token={}", url, t),
            None => url.to_string(),
        };
        connect_async(url).await.unwrap().0
    }

    async fn next_event(ws: &mut Socket) -> Option<ServerEvent> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .ok()??;
            match frame.ok()? {
                WsMessage::Text(text) => return serde_json::from_str(&text).ok(),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut Socket, command: ClientCommand) {
        let json = serde_json::to_string(&command).unwrap();
        ws.send(WsMessage::Text(json.into())).await.unwrap();
    }

    /// Read until `pred` matches, failing after a handful of unrelated events
    async fn expect_event(ws: &mut Socket, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        for _ in 0..10 {
            let event = next_event(ws).await.expect("socket closed");
            if pred(&event) {
                return event;
            }
        }
        panic!("expected event never arrived");
    }

    /// Authenticate and drain the auto-join frames
    async fn ready(url: &str, token: &str, joins: usize) -> Socket {
        let mut ws = open(url, Some(token)).await;
        assert!(matches!(
            next_event(&mut ws).await,
            Some(ServerEvent::Authenticated { .. })
        ));
        for _ in 0..joins {
            assert!(matches!(
                next_event(&mut ws).await,
                Some(ServerEvent::Joined { .. })
            ));
        }
        ws
    }

    fn envelope(conversation_id: &str, text: &str) -> String {
        let key = smashchat_core::ConversationKey::generate();
        SealedMessage::seal(text, &key, 1, conversation_id)
            .unwrap()
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn test_socket_without_token_is_rejected() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut anon = open(&fx.url, None).await;

        match next_event(&mut anon).await {
            Some(ServerEvent::Error { message, conversation_id }) => {
                assert!(message.starts_with("Authentication error"));
                assert_eq!(conversation_id, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(next_event(&mut anon).await.is_none());

        // A message in the room never reaches the rejected socket
        send(
            &mut alice,
            ClientCommand::SendMessage {
                conversation_id: fx.conversation_id.clone(),
                encrypted_content: envelope(&fx.conversation_id, "hi"),
                message_type: Default::default(),
                reply_to_id: None,
            },
        )
        .await;
        expect_event(&mut alice, |e| matches!(e, ServerEvent::NewMessage { .. })).await;
        assert_eq!(fx.state.online_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_and_revoked_tokens_rejected() {
        let fx = fixture().await;

        let mut forged = open(&fx.url, Some("abc.def")).await;
        assert!(matches!(
            next_event(&mut forged).await,
            Some(ServerEvent::Error { .. })
        ));

        let claims = fx.state.tokens.verify(&fx.bob.1, fx.state.now_ms()).unwrap();
        fx.state.store.revoke_session(&claims.sid);
        let mut revoked = open(&fx.url, Some(&fx.bob.1)).await;
        match next_event(&mut revoked).await {
            Some(ServerEvent::Error { message, .. }) => {
                assert!(message.contains("revoked"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_membership_denied() {
        let fx = fixture().await;
        let mut mallory = ready(&fx.url, &fx.mallory.1, 0).await;

        send(
            &mut mallory,
            ClientCommand::JoinChat {
                conversation_id: fx.conversation_id.clone(),
            },
        )
        .await;
        match next_event(&mut mallory).await {
            Some(ServerEvent::Error { conversation_id, .. }) => {
                assert_eq!(conversation_id.as_deref(), Some(fx.conversation_id.as_str()))
            }
            other => panic!("unexpected: {:?}", other),
        }

        send(
            &mut mallory,
            ClientCommand::SendMessage {
                conversation_id: fx.conversation_id.clone(),
                encrypted_content: envelope(&fx.conversation_id, "spam"),
                message_type: Default::default(),
                reply_to_id: None,
            },
        )
        .await;
        assert!(matches!(
            next_event(&mut mallory).await,
            Some(ServerEvent::Error { .. })
        ));
        assert!(fx.state.store.messages(&fx.conversation_id, 0, 10).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_envelope_not_persisted() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;

        send(
            &mut alice,
            ClientCommand::SendMessage {
                conversation_id: fx.conversation_id.clone(),
                encrypted_content: "plaintext leak".into(),
                message_type: Default::default(),
                reply_to_id: None,
            },
        )
        .await;
        assert!(matches!(
            next_event(&mut alice).await,
            Some(ServerEvent::Error { .. })
        ));
        assert_eq!(fx.state.store.message_count(), 0);

        alice.send(WsMessage::Text("{\"type\":\"nope\"}".into())).await.unwrap();
        match next_event(&mut alice).await {
            Some(ServerEvent::Error { message, .. }) => {
                assert!(message.starts_with("Invalid message format"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_camel_case_frames_on_the_wire() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut bob = ready(&fx.url, &fx.bob.1, 1).await;

        let frame = serde_json::json!({
            "type": "send_message",
            "conversationId": fx.conversation_id,
            "encryptedContent": envelope(&fx.conversation_id, "hi"),
            "messageType": "text",
        });
        alice.send(WsMessage::Text(frame.to_string().into())).await.unwrap();

        let raw = loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), bob.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                break serde_json::from_str::<serde_json::Value>(&text).unwrap();
            }
        };
        assert_eq!(raw["type"], "new_message");
        assert_eq!(raw["message"]["conversationId"], fx.conversation_id.as_str());
        assert_eq!(raw["message"]["senderId"], fx.alice.0.as_str());
        assert_eq!(raw["message"]["messageType"], "text");
        assert_eq!(raw["message"]["sequence"], 1);
        assert!(raw["message"]["encryptedContent"].is_string());
    }

    #[tokio::test]
    async fn test_added_member_joins_live() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut mallory = ready(&fx.url, &fx.mallory.1, 0).await;

        assert!(fx.state.add_member(&fx.conversation_id, &fx.mallory.0));
        assert_eq!(
            next_event(&mut mallory).await,
            Some(ServerEvent::Joined {
                conversation_id: fx.conversation_id.clone()
            })
        );

        send(
            &mut alice,
            ClientCommand::SendMessage {
                conversation_id: fx.conversation_id.clone(),
                encrypted_content: envelope(&fx.conversation_id, "welcome"),
                message_type: Default::default(),
                reply_to_id: None,
            },
        )
        .await;
        assert!(matches!(
            next_event(&mut mallory).await,
            Some(ServerEvent::NewMessage { .. })
        ));

        assert!(fx.state.remove_member(&fx.conversation_id, &fx.mallory.0));
        assert!(matches!(next_event(&mut mallory).await, Some(ServerEvent::Left { .. })));

        send(
            &mut mallory,
            ClientCommand::TypingStart {
                conversation_id: fx.conversation_id.clone(),
            },
        )
        .await;
        assert!(matches!(
            next_event(&mut mallory).await,
            Some(ServerEvent::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_order_matches_persistence() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut bob = ready(&fx.url, &fx.bob.1, 1).await;

        for i in 0..20 {
            send(
                &mut alice,
                ClientCommand::SendMessage {
                    conversation_id: fx.conversation_id.clone(),
                    encrypted_content: envelope(&fx.conversation_id, &format!("m{}", i)),
                    message_type: Default::default(),
                    reply_to_id: None,
                },
            )
            .await;
        }

        for socket in [&mut alice, &mut bob] {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                if let Some(ServerEvent::NewMessage { message }) = next_event(socket).await {
                    seen.push(message.sequence);
                }
            }
            assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn test_typing_and_read_exclude_sender() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut bob = ready(&fx.url, &fx.bob.1, 1).await;

        send(
            &mut alice,
            ClientCommand::TypingStart {
                conversation_id: fx.conversation_id.clone(),
            },
        )
        .await;
        match next_event(&mut bob).await {
            Some(ServerEvent::UserTyping {
                user_id,
                user_name,
                is_typing,
                ..
            }) => {
                assert_eq!(user_id, fx.alice.0);
                assert_eq!(user_name, "Alice");
                assert!(is_typing);
            }
            other => panic!("unexpected: {:?}", other),
        }

        send(
            &mut bob,
            ClientCommand::MarkRead {
                conversation_id: fx.conversation_id.clone(),
                message_id: "m-1".into(),
            },
        )
        .await;
        match next_event(&mut alice).await {
            Some(ServerEvent::MessageRead { message_id, user_id, .. }) => {
                assert_eq!(message_id, "m-1");
                assert_eq!(user_id, fx.bob.0);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Alice's own typing event was never echoed back to her
        send(&mut alice, ClientCommand::Ping).await;
        assert_eq!(next_event(&mut alice).await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;
        let mut bob = ready(&fx.url, &fx.bob.1, 1).await;

        send(
            &mut bob,
            ClientCommand::LeaveChat {
                conversation_id: fx.conversation_id.clone(),
            },
        )
        .await;
        assert!(matches!(next_event(&mut bob).await, Some(ServerEvent::Left { .. })));

        send(
            &mut alice,
            ClientCommand::TypingStart {
                conversation_id: fx.conversation_id.clone(),
            },
        )
        .await;
        send(&mut bob, ClientCommand::Ping).await;
        assert_eq!(next_event(&mut bob).await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_set_public_key() {
        let fx = fixture().await;
        let mut alice = ready(&fx.url, &fx.alice.1, 1).await;

        send(
            &mut alice,
            ClientCommand::SetPublicKey {
                public_key: "not a key".into(),
            },
        )
        .await;
        assert!(matches!(
            next_event(&mut alice).await,
            Some(ServerEvent::Error { .. })
        ));

        let armored = smashchat_core::IdentityKeyPair::generate()
            .public_key()
            .to_armored();
        send(
            &mut alice,
            ClientCommand::SetPublicKey {
                public_key: armored.clone(),
            },
        )
        .await;
        assert_eq!(next_event(&mut alice).await, Some(ServerEvent::KeySetSuccess));
        assert_eq!(
            fx.state.store.user(&fx.alice.0).unwrap().public_key,
            Some(armored)
        );
    }

    #[tokio::test]
    async fn test_two_member_encrypted_exchange() {
        let fx = fixture().await;
        let alice_vault = Arc::new(KeyVault::new(Arc::new(MemoryKeyStore::new())));
        let bob_vault = Arc::new(KeyVault::new(Arc::new(MemoryKeyStore::new())));
        let alice_pub = alice_vault.generate_identity(&fx.alice.0).unwrap();
        let bob_pub = bob_vault.generate_identity(&fx.bob.0).unwrap();

        let distribution = alice_vault
            .create_conversation_key(
                &fx.conversation_id,
                &[(fx.alice.0.clone(), alice_pub), (fx.bob.0.clone(), bob_pub)],
            )
            .unwrap();
        let bob_copy = distribution
            .copies
            .iter()
            .find(|c| c.member_id == fx.bob.0)
            .unwrap();
        bob_vault
            .import_conversation_key(&fx.bob.0, &fx.conversation_id, bob_copy)
            .unwrap();

        let (alice, mut alice_events) = RealtimeSession::connect(
            SessionConfig::new(fx.url.clone(), fx.alice.1.clone()),
            alice_vault,
            fx.alice.0.clone(),
        )
        .await
        .unwrap();
        let (bob, mut bob_events) = RealtimeSession::connect(
            SessionConfig::new(fx.url.clone(), fx.bob.1.clone()),
            bob_vault,
            fx.bob.0.clone(),
        )
        .await
        .unwrap();

        for events in [&mut alice_events, &mut bob_events] {
            assert!(matches!(
                events.recv().await,
                Some(SessionEvent::Authenticated { .. })
            ));
            assert!(matches!(events.recv().await, Some(SessionEvent::Joined { .. })));
        }

        alice
            .send_text(&fx.conversation_id, "hello bob", None)
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .unwrap()
        {
            Some(SessionEvent::Message { message, content }) => {
                assert_eq!(message.sender_id, fx.alice.0);
                assert_eq!(content, MessageContent::Text {
                    text: "hello bob".into()
                });
            }
            other => panic!("unexpected: {:?}", other),
        }

        // The relay only ever held ciphertext
        let stored = fx.state.store.messages(&fx.conversation_id, 0, 10);
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].encrypted_content.contains("hello bob"));

        alice.disconnect().await;
        bob.disconnect().await;
    }
}
