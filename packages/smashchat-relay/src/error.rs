//! HTTP error mapping.
//!
//! Every REST handler returns `Result<_, ApiError>`. The JSON body always
//! carries `error` and `code`; lockout and mismatch responses add the
//! fields the login screen needs to render the attempt counter.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use smashchat_core::Error as CoreError;

/// REST error
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Pattern mismatch")]
    PatternMismatch { attempts_remaining: u32, locked: bool },

    #[error("Account locked")]
    Locked { locked_until: i64, remaining_secs: i64 },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<i64>,
}

impl ErrorBody {
    fn new(error: String, code: &'static str) -> Self {
        Self {
            error,
            code,
            valid: None,
            attempts_remaining: None,
            locked: None,
            locked_until: None,
            retry_after_secs: None,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) | ApiError::PatternMismatch { .. } => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Locked { .. } => StatusCode::LOCKED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::PatternMismatch { .. } => "pattern_mismatch",
            ApiError::Locked { .. } => "account_locked",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref detail) = self {
            tracing::error!(error = %detail, "Request failed");
        }

        let mut body = ErrorBody::new(self.to_string(), self.code());
        match self {
            ApiError::PatternMismatch {
                attempts_remaining,
                locked,
            } => {
                body.valid = Some(false);
                body.attempts_remaining = Some(attempts_remaining);
                body.locked = Some(locked);
            }
            ApiError::Locked {
                locked_until,
                remaining_secs,
            } => {
                body.valid = Some(false);
                body.locked = Some(true);
                body.locked_until = Some(locked_until);
                body.retry_after_secs = Some(remaining_secs);
            }
            _ => {}
        }

        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::FormatError(_) | CoreError::InvalidKey(_) => {
                ApiError::BadRequest(err.to_string())
            }
            CoreError::PatternMismatch {
                attempts_remaining,
                locked,
            } => ApiError::PatternMismatch {
                attempts_remaining,
                locked,
            },
            CoreError::AccountLocked {
                locked_until,
                remaining_secs,
            } => ApiError::Locked {
                locked_until,
                remaining_secs,
            },
            CoreError::AuthenticationError(_) => ApiError::Unauthorized(err.to_string()),
            CoreError::MembershipDenied(_) => ApiError::Forbidden(err.to_string()),
            CoreError::PatternNotConfigured | CoreError::StorageNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            CoreError::CredentialConflict => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
