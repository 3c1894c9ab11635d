//! REST API endpoints.
//!
//! Account registration, SMASH pattern setup and verification, login and
//! logout, plus the conversation and key-distribution endpoints clients use
//! before going realtime.
//!
//! - `POST /auth/register`           : create an account, returns a token
//! - `POST /auth/smash/setup`        : store the caller's SMASH pattern
//! - `POST /auth/smash/verify`       : check a pattern (counts attempts)
//! - `POST /auth/login`              : password and/or SMASH login
//! - `POST /auth/logout`             : revoke the caller's session
//! - `POST /conversations`           : create a conversation
//! - `POST /conversations/:id/members`: add a member
//! - `DELETE /conversations/:id/members/:user_id`: remove a member
//! - `GET  /users/:id/public_key`    : a user's armored identity key
//! - `PUT  /conversations/:id/keys`  : upload wrapped key copies
//! - `GET  /conversations/:id/keys`  : the caller's wrapped copy
//! - `GET  /conversations/:id/messages`: persisted envelopes

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use smashchat_core::pattern::AccountProgress;
use smashchat_core::typing::KeyEvent;
use smashchat_core::vault::MemberKeyCopy;
use smashchat_core::{MessageRecord, WrappedKey};

use crate::auth::{bearer_token, hash_password, verify_password};
use crate::error::ApiError;
use crate::state::RelayState;
use crate::store::{KeyRowsOutcome, User};

/// Largest page `GET /conversations/:id/messages` returns
const MAX_PAGE: usize = 200;

// ── Request/Response Types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    pub user_id: String,
    pub progress: AccountProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing: Option<TypingAnnotation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRequest {
    pub pattern: Vec<f64>,
    /// Second drawing for setup confirmation
    pub confirm_pattern: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: Option<String>,
    pub smash_pattern: Option<Vec<f64>>,
    pub typing_sample: Option<Vec<KeyEvent>>,
}

/// Typing verdict attached to a login; never decides the login
#[derive(Debug, Serialize)]
pub struct TypingAnnotation {
    pub accepted: bool,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub member_ids: Vec<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PutKeysRequest {
    pub version: u32,
    pub copies: Vec<MemberKeyCopy>,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub version: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageRecord>,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Unwrap a JSON body, turning shape errors into 400s
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e.body_text())))
}

/// The user behind the request's bearer token
fn caller(state: &RelayState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Authentication error: Missing token".into()))?;
    let (_, user) = state.authenticate(token)?;
    Ok(user)
}

fn caller_session(state: &RelayState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Authentication error: Missing token".into()))?;
    let (claims, _) = state.authenticate(token)?;
    Ok(claims.sid)
}

fn require_member(state: &RelayState, conversation_id: &str, user_id: &str) -> Result<(), ApiError> {
    if state.store.conversation(conversation_id).is_none() {
        return Err(ApiError::NotFound("Conversation not found".into()));
    }
    if !state.store.is_member(conversation_id, user_id) {
        return Err(smashchat_core::Error::MembershipDenied(conversation_id.to_string()).into());
    }
    Ok(())
}

// ── Auth ─────────────────────────────────────────────────────────────────────

/// POST /auth/register
///
/// Body: { "email": "...", "name": "...", "password": "..."? }
pub async fn register(
    State(state): State<RelayState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    if request.email.trim().is_empty() || request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Email and name are required".into()));
    }

    let password_hash = match request.password.as_deref() {
        Some(pw) if !pw.is_empty() => Some(hash_password(pw)?),
        _ => None,
    };

    let user = state
        .store
        .create_user(&request.email, request.name.trim(), password_hash, state.now_ms())
        .ok_or_else(|| ApiError::Conflict("Email already registered".into()))?;
    let (token, _) = state.issue_token(&user.id)?;

    tracing::info!(user_id = %user.id, "Account registered");
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token,
            user_id: user.id,
            progress: user.progress,
            typing: None,
        }),
    ))
}

/// POST /auth/smash/setup
///
/// Body: { "pattern": [x, y, ...], "confirmPattern": [x, y, ...]? }
pub async fn smash_setup(
    State(state): State<RelayState>,
    headers: HeaderMap,
    payload: Result<Json<PatternRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    let request = body(payload)?;

    let stage = match request.confirm_pattern {
        Some(confirm) => state
            .verifier
            .confirm_setup(&user.id, &request.pattern, &confirm)?,
        None => state.verifier.setup(&user.id, &request.pattern)?,
    };
    let progress = state.store.advance_progress(&user.id, stage).unwrap_or(stage);

    tracing::info!(user_id = %user.id, "SMASH pattern configured");
    Ok(Json(json!({
        "message": "SMASH pattern saved",
        "progress": progress,
    })))
}

/// POST /auth/smash/verify
///
/// Body: { "pattern": [x, y, ...] }
pub async fn smash_verify(
    State(state): State<RelayState>,
    headers: HeaderMap,
    payload: Result<Json<PatternRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    let request = body(payload)?;

    if let Err(e) = state.verifier.verify(&user.id, &request.pattern) {
        tracing::warn!(user_id = %user.id, code = e.code(), "SMASH verification failed");
        return Err(e.into());
    }
    Ok(Json(json!({ "valid": true })))
}

/// POST /auth/login
///
/// Body: { "email": "...", "password": "..."?, "smashPattern": [...]?,
///         "typingSample": [{ "key", "timestampMs", "kind" }]? }
///
/// At least one factor is required. The typing verdict is returned as an
/// annotation and never fails the login.
pub async fn login(
    State(state): State<RelayState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    if request.password.is_none() && request.smash_pattern.is_none() {
        return Err(ApiError::BadRequest(
            "Provide a password or a SMASH pattern".into(),
        ));
    }

    let invalid = || ApiError::Unauthorized("Invalid credentials".into());
    let user = state.store.user_by_email(&request.email).ok_or_else(invalid)?;

    if let Some(password) = request.password.as_deref() {
        let ok = user
            .password_hash
            .as_deref()
            .map(|phc| verify_password(password, phc))
            .unwrap_or(false);
        if !ok {
            tracing::warn!(user_id = %user.id, "Password login failed");
            return Err(invalid());
        }
    }

    if let Some(pattern) = request.smash_pattern.as_deref() {
        if let Err(e) = state.verifier.verify(&user.id, pattern) {
            tracing::warn!(user_id = %user.id, code = e.code(), "SMASH login failed");
            return Err(e.into());
        }
    }

    let typing = request.typing_sample.as_deref().map(|events| {
        let verdict = state.analyze_typing(&user.id, events);
        TypingAnnotation {
            accepted: verdict.accepted,
            confidence: verdict.confidence,
        }
    });

    let (token, _) = state.issue_token(&user.id)?;
    tracing::info!(user_id = %user.id, "Login succeeded");

    Ok(Json(SessionResponse {
        token,
        user_id: user.id,
        progress: user.progress,
        typing,
    }))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = caller_session(&state, &headers)?;
    state.store.revoke_session(&session_id);
    Ok(Json(json!({ "message": "Logged out" })))
}

// ── Conversations & keys ─────────────────────────────────────────────────────

/// POST /conversations
///
/// Body: { "memberIds": ["..."], "name": "..."? }
pub async fn create_conversation(
    State(state): State<RelayState>,
    headers: HeaderMap,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    let request = body(payload)?;

    if let Some(missing) = request
        .member_ids
        .iter()
        .find(|id| state.store.user(id).is_none())
    {
        return Err(ApiError::NotFound(format!("Unknown user {}", missing)));
    }

    let (conversation, members) = state.store.create_conversation(
        request.name,
        &user.id,
        request.member_ids,
        state.now_ms(),
    );

    tracing::debug!(conversation_id = %conversation.id, members = members.len(), "Conversation created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": conversation.id,
            "name": conversation.name,
            "memberIds": members,
        })),
    ))
}

/// POST /conversations/:id/members
///
/// Body: { "userId": "..." }
///
/// Members only. The new member's open sockets join the room at once; the
/// caller is expected to distribute a fresh key version through
/// `PUT /conversations/:id/keys` afterwards.
pub async fn add_member(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    payload: Result<Json<AddMemberRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    let request = body(payload)?;
    require_member(&state, &conversation_id, &user.id)?;

    if state.store.user(&request.user_id).is_none() {
        return Err(ApiError::NotFound(format!("Unknown user {}", request.user_id)));
    }
    let added = state.add_member(&conversation_id, &request.user_id);

    Ok(Json(json!({
        "added": added,
        "memberIds": state.store.members(&conversation_id),
    })))
}

/// DELETE /conversations/:id/members/:user_id
///
/// Members only; a member may also remove themselves. Their wrapped key
/// copies are dropped with the membership.
pub async fn remove_member(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path((conversation_id, member_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    require_member(&state, &conversation_id, &user.id)?;

    if !state.remove_member(&conversation_id, &member_id) {
        return Err(ApiError::NotFound(format!("{} is not a member", member_id)));
    }

    Ok(Json(json!({
        "removed": member_id,
        "memberIds": state.store.members(&conversation_id),
    })))
}

/// GET /users/:id/public_key
pub async fn get_public_key(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    caller(&state, &headers)?;
    let user = state
        .store
        .user(&user_id)
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    let public_key = user
        .public_key
        .ok_or_else(|| ApiError::NotFound("User has not published a key".into()))?;

    Ok(Json(json!({ "userId": user.id, "publicKey": public_key })))
}

/// PUT /conversations/:id/keys
///
/// Body: { "version": 2, "copies": [{ "memberId", "version", "wrapped" }] }
///
/// One row per member per version. Every copy must target a member and
/// carry the request's version.
pub async fn put_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    payload: Result<Json<PutKeysRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    let request = body(payload)?;
    require_member(&state, &conversation_id, &user.id)?;

    if request.version == 0 || request.copies.is_empty() {
        return Err(ApiError::BadRequest("Version and copies are required".into()));
    }

    let mut rows: Vec<(String, WrappedKey)> = Vec::with_capacity(request.copies.len());
    for copy in request.copies {
        if copy.version != request.version {
            return Err(ApiError::BadRequest("Copy version mismatch".into()));
        }
        if !state.store.is_member(&conversation_id, &copy.member_id) {
            return Err(ApiError::BadRequest(format!(
                "{} is not a member",
                copy.member_id
            )));
        }
        if rows.iter().any(|(m, _)| *m == copy.member_id) {
            return Err(ApiError::BadRequest(format!(
                "Duplicate copy for {}",
                copy.member_id
            )));
        }
        rows.push((copy.member_id, copy.wrapped));
    }

    match state.store.put_key_rows(&conversation_id, request.version, rows) {
        KeyRowsOutcome::Stored(stored) => {
            tracing::debug!(
                conversation_id = %conversation_id,
                version = request.version,
                stored,
                "Key copies stored"
            );
            Ok(Json(json!({ "stored": stored, "version": request.version })))
        }
        KeyRowsOutcome::Duplicate(member) => Err(ApiError::Conflict(format!(
            "Key version {} already distributed to {}",
            request.version, member
        ))),
    }
}

/// GET /conversations/:id/keys?version=N
pub async fn get_keys(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    require_member(&state, &conversation_id, &user.id)?;

    let (version, wrapped) = state
        .store
        .key_row(&conversation_id, &user.id, query.version)
        .ok_or_else(|| ApiError::NotFound("No key copy for this member".into()))?;

    Ok(Json(MemberKeyCopy {
        member_id: user.id,
        version,
        wrapped,
    }))
}

/// GET /conversations/:id/messages?after=N&limit=M
pub async fn list_messages(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&state, &headers)?;
    require_member(&state, &conversation_id, &user.id)?;

    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE);
    let messages = state
        .store
        .messages(&conversation_id, query.after.unwrap_or(0), limit);
    Ok(Json(MessagesResponse { messages }))
}

// ── Tests ────────────────────────────────────────────────────────────────────
