//! # SMASH Pattern Authentication
//!
//! Capture-side normalization and server-side verification of the
//! gesture/keystroke "SMASH" pattern.
//!
//! ## Verification Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SMASH VERIFICATION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  raw pattern ──► validate_format ──► normalize ──► digest(salt)         │
//! │                       │                                  │              │
//! │                  FormatError                             ▼              │
//! │                                         ┌──────────────────────────┐    │
//! │                                         │  PatternVerifier         │    │
//! │                                         │  ────────────────        │    │
//! │                                         │  1. load credential      │    │
//! │                                         │  2. locked? ► Locked err │    │
//! │                                         │  3. compare digests      │    │
//! │                                         │  4. CAS attempts/lock    │    │
//! │                                         └──────────────────────────┘    │
//! │                                                                         │
//! │  Credential states:                                                    │
//! │                                                                         │
//! │    Active ──(attempts reach max)──► Locked ──(window elapses)──► Active │
//! │      ▲                                                                  │
//! │      └──────────────(correct pattern)── attempts reset to 0             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The stored credential holds only the salted digest. Acceptance is by exact
//! digest equality; [`codec::similarity`] is used for diagnostics and for
//! confirming a freshly drawn pattern during setup.

pub mod codec;
mod verifier;

pub use codec::{digest, generate_salt, normalize, similarity, validate_format, GridPoint};
pub use verifier::{
    CredentialStatus, CredentialStore, LockoutPolicy, MemoryCredentialStore, PatternVerifier,
    SmashCredential, VerifyOutcome,
};

use serde::{Deserialize, Serialize};

/// How far an account has come through onboarding.
///
/// Ordered, and only ever moves forward via [`AccountProgress::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountProgress {
    /// Account exists, nothing configured
    Created = 0,
    /// Waiting for a SMASH pattern
    PatternPending = 1,
    /// Pattern configured, account usable
    Complete = 2,
}

impl AccountProgress {
    /// Move to `target` if it is further along; never moves backwards.
    pub fn advance(self, target: AccountProgress) -> AccountProgress {
        self.max(target)
    }

    /// Numeric stage
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for AccountProgress {
    fn default() -> Self {
        AccountProgress::Created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let p = AccountProgress::Created;
        let p = p.advance(AccountProgress::Complete);
        assert_eq!(p, AccountProgress::Complete);
        let p = p.advance(AccountProgress::PatternPending);
        assert_eq!(p, AccountProgress::Complete);
        assert_eq!(p.as_u8(), 2);
    }

    #[test]
    fn test_progress_serializes_snake_case() {
        let json = serde_json::to_string(&AccountProgress::PatternPending).unwrap();
        assert_eq!(json, "\"pattern_pending\"");
    }
}
