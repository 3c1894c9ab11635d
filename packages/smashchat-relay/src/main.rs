//! SmashChat Relay Server
//!
//! The server half of SmashChat:
//!
//! 1. **SMASH authentication**: account registration, pattern setup, and
//!    verification with attempt counting and timed lockout.
//!
//! 2. **Realtime rooms**: token-authenticated WebSockets joined to the
//!    conversations their user belongs to. Messages are persisted and
//!    broadcast in one step per room.
//!
//! 3. **Key distribution**: stores one wrapped conversation key copy per
//!    member per version and hands each member their own copy.
//!
//! **Privacy**: The relay never sees plaintext content. All E2E encryption
//! happens client-side; the relay only handles opaque encrypted envelopes
//! and wrapped keys it cannot open.

mod api;
mod auth;
mod error;
mod handler;
mod protocol;
mod state;
mod store;

#[cfg(test)]
mod testing;

use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use clap::Parser;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

const MAX_SESSION_TTL_SECS: i64 = 10 * 365 * 24 * 3600;

#[derive(Parser, Debug)]
#[command(name = "smashchat-relay", version, about = "SmashChat relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// HMAC secret for session tokens (at least 32 bytes).
    /// A random secret is generated if unset; tokens then die with the process.
    #[arg(long, env = "SMASH_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Session TTL in seconds (at most ten years)
    #[arg(
        long,
        default_value_t = 86400,
        env = "SESSION_TTL_SECS",
        value_parser = clap::value_parser!(i64).range(1..=MAX_SESSION_TTL_SECS)
    )]
    session_ttl_secs: i64,

    /// Failed SMASH attempts before lockout
    #[arg(long, default_value_t = 5, env = "SMASH_MAX_ATTEMPTS")]
    max_attempts: u32,

    /// Lockout window in seconds
    #[arg(long, default_value_t = 900, env = "SMASH_LOCKOUT_SECS")]
    lockout_secs: u64,

    /// Cleanup interval in seconds
    #[arg(
        long,
        default_value_t = 300,
        env = "CLEANUP_INTERVAL_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    cleanup_interval_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "smashchat_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let token_secret = match args.token_secret {
        Some(secret) => secret.into_bytes(),
        None => {
            tracing::warn!("SMASH_TOKEN_SECRET not set, generating an ephemeral secret");
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    };

    let config = RelayConfig {
        port: args.port,
        token_secret,
        session_ttl_secs: args.session_ttl_secs,
        max_attempts: args.max_attempts,
        lockout_secs: args.lockout_secs,
    };

    let state = RelayState::new(config).expect("Invalid relay configuration");

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = args.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let addr = format!("0.0.0.0:{}", state.config.port);
    let app = build_router(state);

    tracing::info!("SmashChat relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

/// All routes, layered and bound to `state`.
pub fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/auth/register", post(api::register))
        .route("/auth/smash/setup", post(api::smash_setup))
        .route("/auth/smash/verify", post(api::smash_verify))
        .route("/auth/login", post(api::login))
        .route("/auth/logout", post(api::logout))
        .route("/conversations", post(api::create_conversation))
        .route(
            "/conversations/:id/keys",
            put(api::put_keys).get(api::get_keys),
        )
        .route("/conversations/:id/messages", get(api::list_messages))
        .route("/conversations/:id/members", post(api::add_member))
        .route(
            "/conversations/:id/members/:user_id",
            delete(api::remove_member),
        )
        .route("/users/:id/public_key", get(api::get_public_key))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler for client connections.
///
/// The token comes from `Authorization: Bearer` or, for browsers that cannot
/// set headers on a WebSocket, the `token` query parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let token = auth::bearer_token(&headers)
        .map(str::to_string)
        .or(params.token);
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, token))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "smashchat-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_clients": state.online_count(),
        "active_rooms": state.rooms.len(),
        "active_sessions": state.store.session_count(),
        "users": state.store.user_count(),
        "conversations": state.store.conversation_count(),
        "messages": state.store.message_count(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.session_ttl_secs, 24 * 3600);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.lockout_secs, 900);
        assert_eq!(config.token_secret.len(), 32);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["smashchat-relay"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.max_attempts, 5);
        assert!(!args.log_json);
    }

    #[test]
    fn test_args_reject_zero_intervals() {
        assert!(Args::try_parse_from(["smashchat-relay", "--cleanup-interval-secs", "0"]).is_err());
        assert!(Args::try_parse_from(["smashchat-relay", "--session-ttl-secs", "0"]).is_err());
        assert!(Args::try_parse_from([
            "smashchat-relay",
            "--session-ttl-secs",
            "9223372036854775807",
        ])
        .is_err());

        let args = Args::try_parse_from(["smashchat-relay", "--cleanup-interval-secs", "1"]).unwrap();
        assert_eq!(args.cleanup_interval_secs, 1);
    }

    #[test]
    fn test_short_token_secret_rejected() {
        let config = RelayConfig {
            token_secret: b"too short".to_vec(),
            ..RelayConfig::default()
        };
        assert!(RelayState::new(config).is_err());
    }

    #[tokio::test]
    async fn test_state_creation() {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        assert_eq!(state.online_count(), 0);
        state.cleanup_expired();
        assert_eq!(state.store.session_count(), 0);
    }
}
