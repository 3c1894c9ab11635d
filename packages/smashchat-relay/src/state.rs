//! Server state management.
//!
//! Tracks live connections, conversation rooms, and the services the
//! handlers share (store, token signer, pattern verifier, typing profiler).
//!
//! Room broadcast is serialized per conversation: persisting a message and
//! fanning it out happen under the room's mutex with no await in between, so
//! every receiver sees messages in persistence order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use uuid::Uuid;

use smashchat_core::pattern::{CredentialStore, LockoutPolicy, MemoryCredentialStore, PatternVerifier};
use smashchat_core::time::{Clock, SystemClock};
use smashchat_core::typing::{
    KeyEvent, MemoryTypingProfileStore, TypingProfile, TypingProfileStore, TypingProfiler,
    TypingVerdict, NEUTRAL_CONFIDENCE,
};
use smashchat_core::{Error, MessageRecord, PublicKey, Result, SealedMessage, ServerEvent};

use crate::auth::{Claims, TokenSigner};
use crate::protocol::{ClientSender, MessageType};
use crate::store::{AuthSession, NewMessage, Store, User};

/// Default session TTL in seconds (24 hours).
const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 3600;

/// Default lockout window in seconds (15 minutes).
const DEFAULT_LOCKOUT_SECS: u64 = 15 * 60;

/// Default failed attempts before lockout.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// HMAC key for session tokens
    pub token_secret: Vec<u8>,
    pub session_ttl_secs: i64,
    pub max_attempts: u32,
    pub lockout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut token_secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_secret);

        Self {
            port: 8080,
            token_secret,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_secs: DEFAULT_LOCKOUT_SECS,
        }
    }
}

impl RelayConfig {
    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: self.max_attempts,
            lockout: Duration::from_secs(self.lockout_secs),
            ..LockoutPolicy::default()
        }
    }
}

/// One authenticated WebSocket.
#[derive(Clone)]
pub struct Connection {
    pub user_id: String,
    pub user_name: String,
    pub sender: ClientSender,
}

/// Connections currently joined to one conversation.
#[derive(Default)]
pub struct Room {
    connections: HashSet<String>,
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub config: RelayConfig,
    pub store: Arc<Store>,
    pub tokens: Arc<TokenSigner>,
    pub verifier: Arc<PatternVerifier>,
    pub profiler: TypingProfiler,
    pub typing_profiles: Arc<dyn TypingProfileStore>,
    pub clock: Arc<dyn Clock>,

    /// Connection id → live connection.
    pub connections: Arc<DashMap<String, Connection>>,

    /// Conversation id → room. Created on first join.
    pub rooms: Arc<DashMap<String, Arc<Mutex<Room>>>>,
}

impl RelayState {
    /// Create a new relay state with the given configuration.
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// State with an explicit time source for lockout and token expiry.
    pub fn with_clock(config: RelayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let tokens = TokenSigner::new(&config.token_secret)?;
        let credentials: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let verifier =
            PatternVerifier::with_clock(credentials, config.lockout_policy(), clock.clone());

        Ok(Self {
            store: Arc::new(Store::new()),
            tokens: Arc::new(tokens),
            verifier: Arc::new(verifier),
            profiler: TypingProfiler::default(),
            typing_profiles: Arc::new(MemoryTypingProfileStore::new()),
            clock,
            connections: Arc::new(DashMap::new()),
            rooms: Arc::new(DashMap::new()),
            config,
        })
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_millis()
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    /// Start a login session and sign a token for it.
    pub fn issue_token(&self, user_id: &str) -> Result<(String, AuthSession)> {
        let expires_at = self.now_ms() + self.config.session_ttl_secs * 1000;
        let session = self.store.create_session(user_id, expires_at);
        let token = self.tokens.issue(&Claims {
            sub: user_id.to_string(),
            sid: session.id.clone(),
            exp: expires_at,
        })?;
        Ok((token, session))
    }

    /// Resolve a bearer token to its user.
    ///
    /// Checks the signature, the expiry, that the session is still active,
    /// and that the user still exists.
    pub fn authenticate(&self, token: &str) -> Result<(Claims, User)> {
        let now = self.now_ms();
        let claims = self.tokens.verify(token, now)?;

        let session = self
            .store
            .session(&claims.sid)
            .filter(|s| s.user_id == claims.sub && s.is_active(now))
            .ok_or_else(|| Error::AuthenticationError("Session expired or revoked".into()))?;

        let user = self
            .store
            .user(&session.user_id)
            .ok_or_else(|| Error::AuthenticationError("Unknown user".into()))?;
        Ok((claims, user))
    }

    // ── Typing dynamics ───────────────────────────────────────────────────

    /// Score a login capture against the stored profile and learn from it.
    ///
    /// Never fails the caller: a store error is logged and yields a neutral
    /// verdict without touching the stored profile.
    pub fn analyze_typing(&self, user_id: &str, events: &[KeyEvent]) -> TypingVerdict {
        let mut verdict = None;
        let result = self.typing_profiles.update(user_id, &mut |stored| {
            let v = self.profiler.evaluate(stored, events);
            let next = (!v.profile.is_empty()).then(|| v.profile.clone());
            verdict = Some(v);
            next
        });

        match (result, verdict) {
            (Ok(_), Some(v)) => v,
            (Err(e), _) => {
                tracing::warn!(user_id = %user_id, error = %e, "Typing analysis skipped");
                neutral_verdict()
            }
            (Ok(_), None) => neutral_verdict(),
        }
    }

    // ── Connections ───────────────────────────────────────────────────────

    pub fn register_connection(&self, user: &User, sender: ClientSender) -> String {
        let connection_id = Uuid::new_v4().to_string();
        self.connections.insert(
            connection_id.clone(),
            Connection {
                user_id: user.id.clone(),
                user_name: user.name.clone(),
                sender,
            },
        );
        tracing::info!(user_id = %user.id, connection_id = %connection_id, "Socket authenticated");
        connection_id
    }

    /// Drop a connection and remove it from every room.
    pub fn unregister_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        for room in self.rooms.iter() {
            room.value().lock().connections.remove(connection_id);
        }
    }

    pub fn send_to_connection(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(conn) => conn.sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    // ── Rooms ─────────────────────────────────────────────────────────────

    fn room(&self, conversation_id: &str) -> Arc<Mutex<Room>> {
        self.rooms
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn require_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        if self.store.is_member(conversation_id, user_id) {
            Ok(())
        } else {
            Err(Error::MembershipDenied(conversation_id.to_string()))
        }
    }

    /// Join a room. Idempotent; fails for non-members.
    pub fn join_room(&self, conversation_id: &str, connection_id: &str, user_id: &str) -> Result<()> {
        self.require_member(conversation_id, user_id)?;
        self.room(conversation_id)
            .lock()
            .connections
            .insert(connection_id.to_string());
        tracing::debug!(user_id = %user_id, conversation_id = %conversation_id, "Joined room");
        Ok(())
    }

    /// Leave a room. Idempotent.
    pub fn leave_room(&self, conversation_id: &str, connection_id: &str) {
        if let Some(room) = self.rooms.get(conversation_id) {
            room.lock().connections.remove(connection_id);
        }
    }

    /// Join every conversation the user belongs to; returns the ids joined.
    pub fn auto_join(&self, connection_id: &str, user_id: &str) -> Vec<String> {
        let conversations = self.store.conversations_for(user_id);
        for conversation_id in &conversations {
            self.room(conversation_id)
                .lock()
                .connections
                .insert(connection_id.to_string());
        }
        conversations
    }

    /// Add a member and join their live sockets to the room.
    ///
    /// Returns `false` when they already belonged.
    pub fn add_member(&self, conversation_id: &str, user_id: &str) -> bool {
        if !self.store.add_member(conversation_id, user_id) {
            return false;
        }

        let room = self.room(conversation_id);
        let mut room = room.lock();
        for conn in self.connections.iter().filter(|c| c.user_id == user_id) {
            room.connections.insert(conn.key().clone());
            let _ = conn.sender.send(ServerEvent::Joined {
                conversation_id: conversation_id.to_string(),
            });
        }
        tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "Member added");
        true
    }

    /// Remove a member, their key copies, and their sockets from the room.
    pub fn remove_member(&self, conversation_id: &str, user_id: &str) -> bool {
        if !self.store.remove_member(conversation_id, user_id) {
            return false;
        }

        if let Some(room) = self.rooms.get(conversation_id).map(|r| r.clone()) {
            let mut room = room.lock();
            for conn in self.connections.iter().filter(|c| c.user_id == user_id) {
                if room.connections.remove(conn.key()) {
                    let _ = conn.sender.send(ServerEvent::Left {
                        conversation_id: conversation_id.to_string(),
                    });
                }
            }
        }
        tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "Member removed");
        true
    }

    /// Persist an envelope and broadcast it to the room.
    ///
    /// The caller's own connection always receives the message, joined or
    /// not. Non-members get `MembershipDenied` and nothing is stored.
    pub fn send_message(
        &self,
        connection_id: &str,
        conversation_id: &str,
        encrypted_content: String,
        message_type: MessageType,
        reply_to_id: Option<String>,
    ) -> Result<MessageRecord> {
        let sender = self
            .connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or(Error::NotConnected)?;
        self.require_member(conversation_id, &sender.user_id)?;
        SealedMessage::parse(&encrypted_content)?;

        let room = self.room(conversation_id);
        let room = room.lock();

        let record = self.store.append_message(
            NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_id: sender.user_id.clone(),
                sender_name: sender.user_name.clone(),
                encrypted_content,
                message_type,
                reply_to_id,
            },
            self.now_ms(),
        );

        let event = ServerEvent::NewMessage {
            message: record.clone(),
        };
        let mut delivered = 0;
        for member in room.connections.iter() {
            if self.send_to_connection(member, event.clone()) {
                delivered += 1;
            }
        }
        if !room.connections.contains(connection_id) {
            let _ = sender.sender.send(event);
        }
        drop(room);

        tracing::debug!(
            conversation_id = %conversation_id,
            sequence = record.sequence,
            delivered,
            "Message broadcast"
        );
        Ok(record)
    }

    /// Send `event` to everyone in the room except `connection_id`.
    fn broadcast_others(&self, conversation_id: &str, connection_id: &str, event: ServerEvent) {
        let Some(room) = self.rooms.get(conversation_id).map(|r| r.clone()) else {
            return;
        };
        let room = room.lock();
        for member in room.connections.iter().filter(|c| c.as_str() != connection_id) {
            self.send_to_connection(member, event.clone());
        }
    }

    /// Relay a typing indicator to the other joined sockets.
    pub fn relay_typing(&self, connection_id: &str, conversation_id: &str, is_typing: bool) -> Result<()> {
        let conn = self
            .connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or(Error::NotConnected)?;
        self.require_member(conversation_id, &conn.user_id)?;

        self.broadcast_others(
            conversation_id,
            connection_id,
            ServerEvent::UserTyping {
                conversation_id: conversation_id.to_string(),
                user_id: conn.user_id,
                user_name: conn.user_name,
                is_typing,
            },
        );
        Ok(())
    }

    /// Relay a read receipt to the other joined sockets. Not persisted.
    pub fn relay_read(&self, connection_id: &str, conversation_id: &str, message_id: &str) -> Result<()> {
        let conn = self
            .connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or(Error::NotConnected)?;
        self.require_member(conversation_id, &conn.user_id)?;

        self.broadcast_others(
            conversation_id,
            connection_id,
            ServerEvent::MessageRead {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: conn.user_id,
                user_name: conn.user_name,
            },
        );
        Ok(())
    }

    /// Validate an armored key and store it on the user record.
    pub fn set_public_key(&self, user_id: &str, armored: &str) -> Result<PublicKey> {
        let key = PublicKey::from_armored(armored)?;
        if !self.store.set_public_key(user_id, key.to_armored()) {
            return Err(Error::StorageNotFound(format!("user {}", user_id)));
        }
        tracing::debug!(user_id = %user_id, fingerprint = %key.fingerprint(), "Public key set");
        Ok(key)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    /// Drop dead sessions and empty rooms.
    ///
    /// A room someone still holds a handle to is kept even when empty: the
    /// holder is about to join it or broadcast through it.
    pub fn cleanup_expired(&self) {
        let purged = self.store.purge_sessions(self.now_ms());
        self.rooms
            .retain(|_, room| Arc::strong_count(room) > 1 || !room.lock().connections.is_empty());
        if purged > 0 {
            tracing::info!(purged, "Expired sessions removed");
        }
    }
}

fn neutral_verdict() -> TypingVerdict {
    TypingVerdict {
        accepted: true,
        confidence: NEUTRAL_CONFIDENCE,
        profile: TypingProfile::default(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn state_with_member() -> (RelayState, User, String) {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        let alice = state.store.create_user("alice@example.com", "Alice", None, 0).unwrap();
        let (conversation, _) = state.store.create_conversation(None, &alice.id, Vec::new(), 0);
        (state, alice, conversation.id)
    }

    fn is_joined(state: &RelayState, conversation_id: &str, connection_id: &str) -> bool {
        state
            .rooms
            .get(conversation_id)
            .map(|room| room.lock().connections.contains(connection_id))
            .unwrap_or(false)
    }

    #[test]
    fn test_cleanup_keeps_room_being_joined() {
        let (state, alice, conversation_id) = state_with_member();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection_id = state.register_connection(&alice, tx);

        // Cleanup runs between taking the room handle and inserting
        let room = state.room(&conversation_id);
        state.cleanup_expired();
        room.lock().connections.insert(connection_id.clone());
        drop(room);

        assert!(is_joined(&state, &conversation_id, &connection_id));
    }

    #[test]
    fn test_cleanup_drops_idle_rooms() {
        let (state, alice, conversation_id) = state_with_member();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection_id = state.register_connection(&alice, tx);

        state.join_room(&conversation_id, &connection_id, &alice.id).unwrap();
        state.cleanup_expired();
        assert_eq!(state.rooms.len(), 1);

        state.leave_room(&conversation_id, &connection_id);
        state.cleanup_expired();
        assert!(state.rooms.is_empty());
    }

    #[test]
    fn test_member_changes_follow_live_sockets() {
        let (state, _, conversation_id) = state_with_member();
        let bob = state.store.create_user("bob@example.com", "Bob", None, 0).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = state.register_connection(&bob, tx);
        assert!(state.join_room(&conversation_id, &connection_id, &bob.id).is_err());

        assert!(state.add_member(&conversation_id, &bob.id));
        assert!(!state.add_member(&conversation_id, &bob.id));
        assert!(is_joined(&state, &conversation_id, &connection_id));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Joined {
                conversation_id: conversation_id.clone()
            }
        );

        assert!(state.remove_member(&conversation_id, &bob.id));
        assert!(!is_joined(&state, &conversation_id, &connection_id));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::Left {
                conversation_id: conversation_id.clone()
            }
        );
        assert!(state.join_room(&conversation_id, &connection_id, &bob.id).is_err());
    }
}
