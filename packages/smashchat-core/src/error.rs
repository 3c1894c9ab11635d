//! # Error Handling
//!
//! Error types for SmashChat Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Pattern Errors (100-199)                                          │
//! │  │   ├── FormatError           - Malformed biometric input (4xx)       │
//! │  │   ├── PatternMismatch       - Wrong pattern, attempt counted        │
//! │  │   ├── AccountLocked         - Lockout window still running          │
//! │  │   ├── PatternNotConfigured  - No credential for this user           │
//! │  │   └── CredentialConflict    - Concurrent update never settled       │
//! │  │                                                                      │
//! │  ├── Session Errors (200-299)                                          │
//! │  │   ├── AuthenticationError   - Bad/expired/revoked session token     │
//! │  │   └── MembershipDenied      - Not a member of the conversation      │
//! │  │                                                                      │
//! │  ├── Crypto Errors (300-399)                                           │
//! │  │   ├── KeyUnwrapError        - Wrapped key corrupt or wrong key      │
//! │  │   ├── AuthenticationFailed  - AEAD tag did not verify               │
//! │  │   ├── EncryptionFailed      - Encryption operation failed           │
//! │  │   ├── InvalidKey            - Invalid key format/length             │
//! │  │   ├── KeyDerivationFailed   - HKDF/PBKDF2 failure                   │
//! │  │   └── ConversationKeyMissing- No local copy of a conversation key   │
//! │  │                                                                      │
//! │  ├── Storage Errors (400-499)                                          │
//! │  │   ├── StorageReadError / StorageWriteError                          │
//! │  │   ├── StorageNotFound                                               │
//! │  │   └── StorageCorrupted                                              │
//! │  │                                                                      │
//! │  ├── Network Errors (500-599)                                          │
//! │  │   ├── NotConnected / ConnectionFailed                               │
//! │  │   └── ProtocolError                                                 │
//! │  │                                                                      │
//! │  └── Internal Errors (900-999)                                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//!
//! Format errors are rejected at the boundary and never reach the crypto
//! layer. Crypto failures on a single message are recovered per message
//! (see [`crate::messaging::MessageContent::Unavailable`]); they never tear
//! down a session. Authentication errors on a connection always terminate it.

use thiserror::Error;

/// Result type alias for SmashChat Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SmashChat Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Pattern Errors (100-199)
    // ========================================================================

    /// Malformed pattern or keystroke input
    #[error("Invalid pattern format: {0}")]
    FormatError(String),

    /// The pattern did not match the stored digest
    #[error("Pattern mismatch ({attempts_remaining} attempts remaining)")]
    PatternMismatch {
        /// Attempts left before lockout (0 once locked)
        attempts_remaining: u32,
        /// Whether this failure locked the credential
        locked: bool,
    },

    /// The credential is inside its lockout window
    #[error("Account locked, try again in {remaining_secs}s")]
    AccountLocked {
        /// Unix timestamp (milliseconds) when the lock expires
        locked_until: i64,
        /// Whole seconds until the lock expires (always > 0)
        remaining_secs: i64,
    },

    /// No SMASH credential exists for the user
    #[error("No SMASH pattern configured for this account.")]
    PatternNotConfigured,

    /// A compare-and-swap update kept losing to concurrent writers
    #[error("Credential update conflicted with concurrent attempts.")]
    CredentialConflict,

    // ========================================================================
    // Session Errors (200-299)
    // ========================================================================

    /// Session token missing, malformed, expired or revoked
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Caller is not a member of the conversation
    #[error("Not a member of conversation {0}")]
    MembershipDenied(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// A wrapped conversation key could not be unwrapped
    #[error("Failed to unwrap key: {0}")]
    KeyUnwrapError(String),

    /// Payload authentication tag did not verify
    #[error("Payload authentication failed")]
    AuthenticationFailed,

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// No local copy of the requested conversation key
    #[error("No key for conversation {conversation_id} (version {version:?})")]
    ConversationKeyMissing {
        /// Conversation the key belongs to
        conversation_id: String,
        /// Requested version, `None` for "latest"
        version: Option<u32>,
    },

    /// No identity keypair stored for the principal
    #[error("No identity keypair for {0}")]
    NoIdentity(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Item not found in storage
    #[error("Item not found: {0}")]
    StorageNotFound(String),

    /// Data corruption detected
    #[error("Data corruption detected: {0}")]
    StorageCorrupted(String),

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// Session is not connected
    #[error("Not connected to the server.")]
    NotConnected,

    /// Failed to connect
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Protocol-level error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Stable numeric error code
    ///
    /// - 100-199: Pattern
    /// - 200-299: Session
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Network
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Pattern (100-199)
            Error::FormatError(_) => 100,
            Error::PatternMismatch { .. } => 101,
            Error::AccountLocked { .. } => 102,
            Error::PatternNotConfigured => 103,
            Error::CredentialConflict => 104,

            // Session (200-299)
            Error::AuthenticationError(_) => 200,
            Error::MembershipDenied(_) => 201,

            // Crypto (300-399)
            Error::KeyUnwrapError(_) => 300,
            Error::AuthenticationFailed => 301,
            Error::EncryptionFailed(_) => 302,
            Error::InvalidKey(_) => 303,
            Error::KeyDerivationFailed(_) => 304,
            Error::ConversationKeyMissing { .. } => 305,
            Error::NoIdentity(_) => 306,

            // Storage (400-499)
            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::StorageNotFound(_) => 402,
            Error::StorageCorrupted(_) => 403,

            // Network (500-599)
            Error::NotConnected => 500,
            Error::ConnectionFailed(_) => 501,
            Error::ProtocolError(_) => 502,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying later or by
    /// correcting the input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FormatError(_)
                | Error::PatternMismatch { .. }
                | Error::AccountLocked { .. }
                | Error::CredentialConflict
                | Error::ConnectionFailed(_)
                | Error::NotConnected
        )
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Error::FormatError(_)
                | Error::PatternMismatch { .. }
                | Error::PatternNotConfigured
                | Error::AuthenticationError(_)
        )
    }

    /// Crypto failures that are reported per message instead of failing a session
    pub fn is_message_level(&self) -> bool {
        matches!(
            self,
            Error::KeyUnwrapError(_)
                | Error::AuthenticationFailed
                | Error::ConversationKeyMissing { .. }
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::SerializationError(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::DeserializationError(format!("Invalid base64: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::ConnectionFailed(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
