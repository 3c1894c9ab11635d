//! Credential storage and the attempt/lockout state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::codec;
use super::AccountProgress;
use crate::error::{Error, Result};
use crate::time::{Clock, SystemClock};

/// Upper bound on compare-and-swap retries for one verification
const MAX_CAS_RETRIES: usize = 32;

/// Minimum similarity between the two setup drawings
pub const DEFAULT_CONFIRM_THRESHOLD: f64 = 0.8;

/// Stored SMASH credential for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmashCredential {
    /// Owner
    pub user_id: String,
    /// Hex PBKDF2 digest of the normalized pattern
    pub digest: String,
    /// Hex salt used for the digest
    pub salt: String,
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Lock flag
    pub is_locked: bool,
    /// Lock expiry (Unix ms)
    pub locked_until: Option<i64>,
    /// Failures allowed before locking
    pub max_attempts: u32,
    /// Bumped by the store on every write
    pub revision: u64,
}

impl SmashCredential {
    fn lock_active(&self, now: i64) -> Option<i64> {
        match self.locked_until {
            Some(until) if self.is_locked && now < until => Some(until),
            _ => None,
        }
    }

    fn clear_lock(&mut self) {
        self.attempts = 0;
        self.is_locked = false;
        self.locked_until = None;
    }
}

/// Attempt limits
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    /// Failures before the credential locks
    pub max_attempts: u32,
    /// How long a lock lasts
    pub lockout: Duration,
    /// Similarity required by [`PatternVerifier::confirm_setup`]
    pub confirm_threshold: f64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout: Duration::from_secs(15 * 60),
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
        }
    }
}

/// Successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    /// Verified user
    pub user_id: String,
    /// When the verification happened (Unix ms)
    pub verified_at: i64,
}

/// Read-only view of a credential's lock state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub attempts: u32,
    pub attempts_remaining: u32,
    pub locked: bool,
    pub locked_until: Option<i64>,
}

// ============================================================================
// STORE
// ============================================================================

/// Persistence for SMASH credentials.
///
/// `compare_and_swap` is the only way the verifier mutates an existing
/// record, so every implementation must make it atomic per user.
pub trait CredentialStore: Send + Sync {
    /// Load a credential
    fn get(&self, user_id: &str) -> Result<Option<SmashCredential>>;

    /// Insert or replace a credential unconditionally
    fn insert(&self, credential: SmashCredential) -> Result<()>;

    /// Remove a credential, returning whether one existed
    fn delete(&self, user_id: &str) -> Result<bool>;

    /// Replace the record only if its revision still equals `expected_revision`.
    ///
    /// Returns `false` when another writer got there first.
    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_revision: u64,
        new: SmashCredential,
    ) -> Result<bool>;
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, SmashCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, user_id: &str) -> Result<Option<SmashCredential>> {
        Ok(self.records.read().get(user_id).cloned())
    }

    fn insert(&self, mut credential: SmashCredential) -> Result<()> {
        let mut records = self.records.write();
        let next_revision = records
            .get(&credential.user_id)
            .map(|old| old.revision + 1)
            .unwrap_or(0);
        credential.revision = next_revision;
        records.insert(credential.user_id.clone(), credential);
        Ok(())
    }

    fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.records.write().remove(user_id).is_some())
    }

    fn compare_and_swap(
        &self,
        user_id: &str,
        expected_revision: u64,
        mut new: SmashCredential,
    ) -> Result<bool> {
        let mut records = self.records.write();
        match records.get(user_id) {
            Some(current) if current.revision == expected_revision => {
                new.revision = expected_revision + 1;
                records.insert(user_id.to_string(), new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// VERIFIER
// ============================================================================

/// Sets up and verifies SMASH patterns with attempt counting and lockout
pub struct PatternVerifier {
    store: Arc<dyn CredentialStore>,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
}

impl PatternVerifier {
    /// Verifier over `store` using the system clock
    pub fn new(store: Arc<dyn CredentialStore>, policy: LockoutPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    /// Verifier with an explicit time source
    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        policy: LockoutPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Store a new credential for `user_id`, replacing any existing one.
    ///
    /// Returns the progress stage the account should advance to.
    pub fn setup(&self, user_id: &str, raw: &[f64]) -> Result<AccountProgress> {
        codec::validate_format(raw)?;

        let salt = codec::generate_salt();
        let digest = codec::digest(&codec::normalize(raw), &salt);

        self.store.insert(SmashCredential {
            user_id: user_id.to_string(),
            digest,
            salt,
            attempts: 0,
            is_locked: false,
            locked_until: None,
            max_attempts: self.policy.max_attempts,
            revision: 0,
        })?;

        tracing::info!(user_id = %user_id, "SMASH pattern configured");
        Ok(AccountProgress::Complete)
    }

    /// Setup from two drawings of the same pattern.
    ///
    /// The drawings must be similar enough; the first one is stored.
    pub fn confirm_setup(
        &self,
        user_id: &str,
        first: &[f64],
        second: &[f64],
    ) -> Result<AccountProgress> {
        codec::validate_format(first)?;
        codec::validate_format(second)?;

        let score = codec::similarity(first, second);
        if score < self.policy.confirm_threshold {
            tracing::debug!(user_id = %user_id, score, "Setup confirmation rejected");
            return Err(Error::FormatError(
                "Confirmation pattern does not match the first drawing".into(),
            ));
        }

        self.setup(user_id, first)
    }

    /// Verify a pattern attempt.
    ///
    /// A live lock is reported before any digest work happens. Failures bump
    /// the attempt counter and lock the credential once it reaches
    /// `max_attempts`.
    pub fn verify(&self, user_id: &str, raw: &[f64]) -> Result<VerifyOutcome> {
        codec::validate_format(raw)?;
        let normalized = codec::normalize(raw);

        // (salt, digest) of the last computation, reused across CAS retries
        let mut cached: Option<(String, String)> = None;

        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .store
                .get(user_id)?
                .ok_or(Error::PatternNotConfigured)?;
            let now = self.clock.now_millis();

            if let Some(until) = current.lock_active(now) {
                tracing::warn!(user_id = %user_id, "Verification refused, credential locked");
                return Err(locked_error(until, now));
            }

            let mut next = current.clone();
            if next.is_locked {
                // Window elapsed
                next.clear_lock();
            }

            let candidate = match &cached {
                Some((salt, digest)) if *salt == current.salt => digest.clone(),
                _ => {
                    let digest = codec::digest(&normalized, &current.salt);
                    cached = Some((current.salt.clone(), digest.clone()));
                    digest
                }
            };

            if codec::digests_equal(&candidate, &current.digest) {
                if current.attempts == 0 && !current.is_locked {
                    return Ok(self.verified(user_id, now));
                }
                next.clear_lock();
                if self.store.compare_and_swap(user_id, current.revision, next)? {
                    return Ok(self.verified(user_id, now));
                }
                continue;
            }

            next.attempts += 1;
            let locked = next.attempts >= next.max_attempts;
            if locked {
                next.is_locked = true;
                next.locked_until = Some(now + self.policy.lockout.as_millis() as i64);
            }
            let attempts_remaining = next.max_attempts.saturating_sub(next.attempts);

            if self.store.compare_and_swap(user_id, current.revision, next)? {
                if locked {
                    tracing::warn!(user_id = %user_id, "Too many failed attempts, credential locked");
                } else {
                    tracing::warn!(user_id = %user_id, attempts_remaining, "Pattern mismatch");
                }
                return Err(Error::PatternMismatch {
                    attempts_remaining: if locked { 0 } else { attempts_remaining },
                    locked,
                });
            }
        }

        tracing::warn!(user_id = %user_id, "Credential update kept conflicting");
        Err(Error::CredentialConflict)
    }

    /// Current attempt/lock state
    pub fn status(&self, user_id: &str) -> Result<CredentialStatus> {
        let credential = self
            .store
            .get(user_id)?
            .ok_or(Error::PatternNotConfigured)?;
        let now = self.clock.now_millis();

        Ok(match credential.lock_active(now) {
            Some(until) => CredentialStatus {
                attempts: credential.attempts,
                attempts_remaining: 0,
                locked: true,
                locked_until: Some(until),
            },
            None if credential.is_locked => CredentialStatus {
                attempts: 0,
                attempts_remaining: credential.max_attempts,
                locked: false,
                locked_until: None,
            },
            None => CredentialStatus {
                attempts: credential.attempts,
                attempts_remaining: credential.max_attempts.saturating_sub(credential.attempts),
                locked: false,
                locked_until: None,
            },
        })
    }

    /// Administrative unlock: clear attempts and any lock
    pub fn reset(&self, user_id: &str) -> Result<()> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .store
                .get(user_id)?
                .ok_or(Error::PatternNotConfigured)?;
            let mut next = current.clone();
            next.clear_lock();
            if self.store.compare_and_swap(user_id, current.revision, next)? {
                tracing::info!(user_id = %user_id, "SMASH credential reset");
                return Ok(());
            }
        }
        Err(Error::CredentialConflict)
    }

    /// Delete the credential entirely
    pub fn remove(&self, user_id: &str) -> Result<bool> {
        self.store.delete(user_id)
    }

    fn verified(&self, user_id: &str, now: i64) -> VerifyOutcome {
        tracing::info!(user_id = %user_id, "SMASH pattern verified");
        VerifyOutcome {
            user_id: user_id.to_string(),
            verified_at: now,
        }
    }
}

fn locked_error(locked_until: i64, now: i64) -> Error {
    let remaining_ms = (locked_until - now).max(1);
    Error::AccountLocked {
        locked_until,
        remaining_secs: (remaining_ms + 999) / 1000,
    }
}
