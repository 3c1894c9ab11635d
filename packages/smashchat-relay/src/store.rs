//! In-memory collaborator store.
//!
//! Users, auth sessions, conversations, memberships, persisted message
//! envelopes and wrapped key rows. Every map is a `DashMap`, so handlers
//! never hold a lock across an await.
//!
//! Messages are only appended through [`Store::append_message`], which
//! assigns the per-conversation sequence number under the conversation's
//! entry lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use smashchat_core::network::{MessageRecord, MessageType};
use smashchat_core::pattern::AccountProgress;
use smashchat_core::WrappedKey;
use uuid::Uuid;

/// A registered account
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub progress: AccountProgress,
    /// Armored identity public key
    pub public_key: Option<String>,
    pub created_at: i64,
}

/// A login session backing one or more tokens
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: String,
    pub expires_at: i64,
    pub revoked: bool,
}

impl AuthSession {
    pub fn is_active(&self, now_ms: i64) -> bool {
        !self.revoked && now_ms < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

/// Fields of a message before it is persisted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub encrypted_content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<String>,
}

/// Outcome of storing wrapped key copies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRowsOutcome {
    Stored(usize),
    /// A row for this member and version already exists
    Duplicate(String),
}

#[derive(Default)]
pub struct Store {
    users: DashMap<String, User>,
    /// lowercase email → user id
    emails: DashMap<String, String>,
    sessions: DashMap<String, AuthSession>,
    conversations: DashMap<String, Conversation>,
    members: DashMap<String, BTreeSet<String>>,
    messages: DashMap<String, Vec<MessageRecord>>,
    /// conversation → version → member → wrapped copy
    key_rows: DashMap<String, BTreeMap<u32, HashMap<String, WrappedKey>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Users ─────────────────────────────────────────────────────────────

    /// Create a user; `None` if the email is taken.
    pub fn create_user(
        &self,
        email: &str,
        name: &str,
        password_hash: Option<String>,
        now_ms: i64,
    ) -> Option<User> {
        let id = Uuid::new_v4().to_string();
        match self.emails.entry(email.trim().to_lowercase()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let user = User {
            id: id.clone(),
            email: email.trim().to_string(),
            name: name.to_string(),
            password_hash,
            progress: AccountProgress::PatternPending,
            public_key: None,
            created_at: now_ms,
        };
        self.users.insert(id, user.clone());
        Some(user)
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = self.emails.get(&email.trim().to_lowercase())?.clone();
        self.user(&id)
    }

    /// Move a user's progress forward; never backwards.
    pub fn advance_progress(&self, user_id: &str, to: AccountProgress) -> Option<AccountProgress> {
        let mut user = self.users.get_mut(user_id)?;
        user.progress = user.progress.advance(to);
        Some(user.progress)
    }

    pub fn set_public_key(&self, user_id: &str, armored: String) -> bool {
        match self.users.get_mut(user_id) {
            Some(mut user) => {
                user.public_key = Some(armored);
                true
            }
            None => false,
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub fn create_session(&self, user_id: &str, expires_at: i64) -> AuthSession {
        let session = AuthSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            expires_at,
            revoked: false,
        };
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn session(&self, session_id: &str) -> Option<AuthSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn revoke_session(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Drop expired and revoked sessions
    pub fn purge_sessions(&self, now_ms: i64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.is_active(now_ms));
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Conversations ─────────────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        name: Option<String>,
        created_by: &str,
        member_ids: impl IntoIterator<Item = String>,
        now_ms: i64,
    ) -> (Conversation, Vec<String>) {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            name,
            created_by: created_by.to_string(),
            created_at: now_ms,
        };

        let mut members: BTreeSet<String> = member_ids.into_iter().collect();
        members.insert(created_by.to_string());
        let listed = members.iter().cloned().collect();

        self.members.insert(conversation.id.clone(), members);
        self.conversations
            .insert(conversation.id.clone(), conversation.clone());
        (conversation, listed)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.get(conversation_id).map(|c| c.clone())
    }

    pub fn is_member(&self, conversation_id: &str, user_id: &str) -> bool {
        self.members
            .get(conversation_id)
            .map(|m| m.contains(user_id))
            .unwrap_or(false)
    }

    pub fn members(&self, conversation_id: &str) -> Vec<String> {
        self.members
            .get(conversation_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a member; `false` if the conversation is unknown or they already belong
    pub fn add_member(&self, conversation_id: &str, user_id: &str) -> bool {
        self.members
            .get_mut(conversation_id)
            .map(|mut m| m.insert(user_id.to_string()))
            .unwrap_or(false)
    }

    /// Remove a member and every wrapped key copy held for them
    pub fn remove_member(&self, conversation_id: &str, user_id: &str) -> bool {
        let removed = self
            .members
            .get_mut(conversation_id)
            .map(|mut m| m.remove(user_id))
            .unwrap_or(false);
        if removed {
            if let Some(mut versions) = self.key_rows.get_mut(conversation_id) {
                for rows in versions.values_mut() {
                    rows.remove(user_id);
                }
                versions.retain(|_, rows| !rows.is_empty());
            }
        }
        removed
    }

    /// Every conversation `user_id` belongs to
    pub fn conversations_for(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .members
            .iter()
            .filter(|entry| entry.value().contains(user_id))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    // ── Messages ──────────────────────────────────────────────────────────

    /// Persist an envelope and assign its sequence number
    pub fn append_message(&self, message: NewMessage, now_ms: i64) -> MessageRecord {
        let mut log = self
            .messages
            .entry(message.conversation_id.clone())
            .or_default();

        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            encrypted_content: message.encrypted_content,
            message_type: message.message_type,
            reply_to_id: message.reply_to_id,
            sequence: log.len() as u64 + 1,
            created_at: now_ms,
        };
        log.push(record.clone());
        record
    }

    /// Messages with `sequence > after`, oldest first
    pub fn messages(&self, conversation_id: &str, after: u64, limit: usize) -> Vec<MessageRecord> {
        self.messages
            .get(conversation_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.iter().map(|log| log.len()).sum()
    }

    // ── Key rows ──────────────────────────────────────────────────────────

    /// Store one wrapped copy per member for a key version.
    ///
    /// All-or-nothing: if any member already has a row for `version`,
    /// nothing is written.
    pub fn put_key_rows(
        &self,
        conversation_id: &str,
        version: u32,
        copies: Vec<(String, WrappedKey)>,
    ) -> KeyRowsOutcome {
        let mut versions = self.key_rows.entry(conversation_id.to_string()).or_default();
        let rows = versions.entry(version).or_default();

        if let Some((member, _)) = copies.iter().find(|(m, _)| rows.contains_key(m)) {
            return KeyRowsOutcome::Duplicate(member.clone());
        }

        let count = copies.len();
        rows.extend(copies);
        KeyRowsOutcome::Stored(count)
    }

    /// A member's wrapped copy: the given version, or the newest one they have
    pub fn key_row(
        &self,
        conversation_id: &str,
        member_id: &str,
        version: Option<u32>,
    ) -> Option<(u32, WrappedKey)> {
        let versions = self.key_rows.get(conversation_id)?;
        match version {
            Some(v) => versions
                .get(&v)
                .and_then(|rows| rows.get(member_id))
                .map(|w| (v, w.clone())),
            None => versions
                .iter()
                .rev()
                .find_map(|(v, rows)| rows.get(member_id).map(|w| (*v, w.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped(byte: u8) -> WrappedKey {
        WrappedKey::from_bytes(vec![byte; smashchat_core::crypto::WRAPPED_KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let store = Store::new();
        let user = store.create_user("Ann@Example.com", "Ann", None, 0).unwrap();
        assert_eq!(user.progress, AccountProgress::PatternPending);
        assert!(store.create_user("ann@example.com ", "Other", None, 0).is_none());
        assert_eq!(store.user_by_email("ANN@example.com").unwrap().id, user.id);
    }

    #[test]
    fn test_progress_never_regresses() {
        let store = Store::new();
        let user = store.create_user("a@x", "A", None, 0).unwrap();
        assert_eq!(
            store.advance_progress(&user.id, AccountProgress::Complete),
            Some(AccountProgress::Complete)
        );
        assert_eq!(
            store.advance_progress(&user.id, AccountProgress::Created),
            Some(AccountProgress::Complete)
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let store = Store::new();
        let session = store.create_session("u1", 1_000);
        assert!(store.session(&session.id).unwrap().is_active(500));
        assert!(!store.session(&session.id).unwrap().is_active(1_000));

        assert!(store.revoke_session(&session.id));
        assert!(!store.session(&session.id).unwrap().is_active(500));
        assert_eq!(store.purge_sessions(500), 1);
        assert!(store.session(&session.id).is_none());
    }

    #[test]
    fn test_membership() {
        let store = Store::new();
        let (conv, members) =
            store.create_conversation(None, "alice", vec!["bob".to_string()], 0);
        assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
        assert!(store.is_member(&conv.id, "alice"));
        assert!(store.is_member(&conv.id, "bob"));
        assert!(!store.is_member(&conv.id, "mallory"));
        assert!(!store.is_member("nope", "alice"));
        assert_eq!(store.conversations_for("bob"), vec![conv.id.clone()]);
        assert!(store.conversations_for("mallory").is_empty());
    }

    #[test]
    fn test_member_changes() {
        let store = Store::new();
        let (conv, _) = store.create_conversation(None, "alice", Vec::new(), 0);
        assert!(store.add_member(&conv.id, "bob"));
        assert!(!store.add_member(&conv.id, "bob"));
        assert!(!store.add_member("nope", "bob"));
        assert_eq!(store.members(&conv.id), vec!["alice".to_string(), "bob".to_string()]);

        store.put_key_rows(&conv.id, 1, vec![("alice".into(), wrapped(1)), ("bob".into(), wrapped(2))]);
        store.put_key_rows(&conv.id, 2, vec![("bob".into(), wrapped(3))]);

        assert!(store.remove_member(&conv.id, "bob"));
        assert!(!store.remove_member(&conv.id, "bob"));
        assert!(!store.is_member(&conv.id, "bob"));
        assert_eq!(store.key_row(&conv.id, "bob", None), None);
        assert_eq!(store.key_row(&conv.id, "alice", None), Some((1, wrapped(1))));
        assert!(store.conversations_for("bob").is_empty());
    }

    #[test]
    fn test_message_sequence() {
        let store = Store::new();
        let draft = |text: &str| NewMessage {
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: "Ann".into(),
            encrypted_content: text.into(),
            message_type: MessageType::Text,
            reply_to_id: None,
        };

        let first = store.append_message(draft("a"), 1);
        let second = store.append_message(draft("b"), 2);
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let after_first = store.messages("c1", 1, 50);
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].encrypted_content, "b");
        assert_eq!(store.message_count(), 2);
    }

    #[test]
    fn test_key_rows() {
        let store = Store::new();
        assert_eq!(
            store.put_key_rows("c1", 1, vec![("a".into(), wrapped(1)), ("b".into(), wrapped(2))]),
            KeyRowsOutcome::Stored(2)
        );
        assert_eq!(
            store.put_key_rows("c1", 2, vec![("a".into(), wrapped(3))]),
            KeyRowsOutcome::Stored(1)
        );
        assert_eq!(
            store.put_key_rows("c1", 1, vec![("a".into(), wrapped(9))]),
            KeyRowsOutcome::Duplicate("a".into())
        );

        assert_eq!(store.key_row("c1", "a", None), Some((2, wrapped(3))));
        assert_eq!(store.key_row("c1", "b", None), Some((1, wrapped(2))));
        assert_eq!(store.key_row("c1", "a", Some(1)), Some((1, wrapped(1))));
        assert_eq!(store.key_row("c1", "b", Some(2)), None);
        assert_eq!(store.key_row("c2", "a", None), None);
    }
}
