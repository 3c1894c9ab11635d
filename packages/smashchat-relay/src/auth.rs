//! Session tokens and password hashing.
//!
//! Tokens are `base64url(claims).base64url(hmac_sha256(claims))`. A valid
//! signature and an unexpired `exp` are necessary but not sufficient: the
//! session named by `sid` must also still be active in the store.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use smashchat_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Minimum token secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

const ARGON2_PARAMS: argon2::Params = match argon2::Params::new(
    19 * 1024, // 19 MiB memory cost
    2,         // 2 iterations
    1,         // 1 lane
    None,
) {
    Ok(params) => params,
    Err(_) => panic!("Invalid Argon2 parameters"),
};

/// Signed token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Session id
    pub sid: String,
    /// Expiry (Unix ms)
    pub exp: i64,
}

/// Issues and checks session tokens
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::InvalidKey(format!(
                "Token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| Error::InvalidKey(e.to_string()))
    }

    pub fn issue(&self, claims: &Claims) -> Result<String> {
        let payload = B64URL.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = B64URL.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Check signature and expiry. Session liveness is the caller's job.
    pub fn verify(&self, token: &str, now_ms: i64) -> Result<Claims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::AuthenticationError("Malformed token".into()))?;
        let signature = B64URL
            .decode(signature)
            .map_err(|_| Error::AuthenticationError("Malformed token".into()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::AuthenticationError("Invalid token signature".into()))?;

        let claims: Claims = B64URL
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| Error::AuthenticationError("Malformed token".into()))?;

        if now_ms >= claims.exp {
            return Err(Error::AuthenticationError("Token expired".into()));
        }
        Ok(claims)
    }
}

/// Bearer token from the `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Argon2id PHC string for `password`
pub fn hash_password(password: &str) -> Result<String> {
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        ARGON2_PARAMS,
    );
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("Password hashing failed: {}", e)))
}

/// Check `password` against a stored PHC string
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signer() -> TokenSigner {
        TokenSigner::new(&[7u8; 32]).unwrap()
    }

    fn claims(exp: i64) -> Claims {
        Claims {
            sub: "user-1".into(),
            sid: "sess-1".into(),
            exp,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let token = signer().issue(&claims(2_000)).unwrap();
        assert_eq!(signer().verify(&token, 1_000).unwrap(), claims(2_000));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = signer().issue(&claims(2_000)).unwrap();
        assert!(matches!(
            signer().verify(&token, 2_000),
            Err(Error::AuthenticationError(_))
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let token = signer().issue(&claims(2_000)).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_payload = B64URL.encode(serde_json::to_vec(&claims(i64::MAX)).unwrap());
        let forged = format!("{}.{}", forged_payload, sig);
        assert!(signer().verify(&forged, 1_000).is_err());

        let other = TokenSigner::new(&[8u8; 32]).unwrap();
        assert!(other.verify(&token, 1_000).is_err());
        assert!(signer().verify("garbage", 1_000).is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenSigner::new(b"short").is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_password_hash_round_trip() {
        let phc = hash_password("correct horse").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &phc));
        assert!(!verify_password("wrong", &phc));
        assert!(!verify_password("correct horse", "not a phc string"));
    }
}
