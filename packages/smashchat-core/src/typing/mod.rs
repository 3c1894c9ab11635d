//! # Typing Dynamics
//!
//! Keystroke timing as a soft, continuously learned second signal.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       TYPING PROFILE                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  key-down timestamps  t0   t1   t2   t3                                 │
//! │  intervals               Δ1   Δ2   Δ3                                   │
//! │                                                                         │
//! │  speed    = count / (t_last - t0) * 60000      keys per minute         │
//! │  variance = population std-dev of Δ                                    │
//! │  profile  = Δ / max(Δ)                         order preserved         │
//! │                                                                         │
//! │  score    = 0.3·sim(speed) + 0.3·sim(variance) + 0.4·cos(profile)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The verdict never blocks a login on its own. Anything that prevents a
//! meaningful comparison (too few keys, broken timestamps) yields a neutral
//! pass with confidence `0.5`.

mod store;

pub use store::{MemoryTypingProfileStore, TypingProfileStore};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Confidence reported when no real comparison was possible
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

/// Kind of key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventKind {
    Down,
    Up,
}

/// One timed key transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub key: String,
    pub timestamp_ms: f64,
    pub kind: KeyEventKind,
}

impl KeyEvent {
    pub fn down(key: impl Into<String>, timestamp_ms: f64) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            kind: KeyEventKind::Down,
        }
    }

    pub fn up(key: impl Into<String>, timestamp_ms: f64) -> Self {
        Self {
            key: key.into(),
            timestamp_ms,
            kind: KeyEventKind::Up,
        }
    }
}

/// Learned typing rhythm of one user
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypingProfile {
    /// Keys per minute
    pub speed: f64,
    /// Standard deviation of inter-key intervals (ms)
    pub variance: f64,
    /// Inter-key intervals normalized by the largest one
    pub profile: Vec<f64>,
    /// Captures folded into this profile
    pub samples: u32,
}

impl TypingProfile {
    /// A sample too short to say anything
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Scoring weights and thresholds
#[derive(Debug, Clone)]
pub struct TypingPolicy {
    /// Scores strictly above this are accepted
    pub accept_threshold: f64,
    pub speed_weight: f64,
    pub variance_weight: f64,
    pub profile_weight: f64,
    /// Sample count beyond which history stops gaining weight
    pub history_cap: u32,
}

impl Default for TypingPolicy {
    fn default() -> Self {
        Self {
            accept_threshold: 0.3,
            speed_weight: 0.3,
            variance_weight: 0.3,
            profile_weight: 0.4,
            history_cap: 10,
        }
    }
}

/// Result of evaluating one capture
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypingVerdict {
    pub accepted: bool,
    pub confidence: f64,
    /// Profile to store after this capture
    pub profile: TypingProfile,
}

/// Builds, blends and scores typing profiles
#[derive(Debug, Clone, Default)]
pub struct TypingProfiler {
    policy: TypingPolicy,
}

impl TypingProfiler {
    pub fn new(policy: TypingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TypingPolicy {
        &self.policy
    }

    /// Build a single-sample profile from raw events.
    ///
    /// Fewer than two key-downs yields the zeroed profile.
    pub fn record_sample(&self, events: &[KeyEvent]) -> TypingProfile {
        self.try_record_sample(events).unwrap_or_default()
    }

    fn try_record_sample(&self, events: &[KeyEvent]) -> Result<TypingProfile> {
        let downs: Vec<f64> = events
            .iter()
            .filter(|e| e.kind == KeyEventKind::Down)
            .map(|e| e.timestamp_ms)
            .collect();
        if downs.len() < 2 {
            return Ok(TypingProfile::default());
        }

        if downs.iter().any(|t| !t.is_finite()) {
            return Err(Error::FormatError("Non-finite key timestamp".into()));
        }

        let intervals: Vec<f64> = downs.windows(2).map(|w| w[1] - w[0]).collect();
        if intervals.iter().any(|d| *d < 0.0) {
            return Err(Error::FormatError("Key timestamps are not monotonic".into()));
        }

        let elapsed = downs[downs.len() - 1] - downs[0];
        if elapsed <= 0.0 {
            return Err(Error::FormatError("Zero elapsed typing time".into()));
        }

        let speed = downs.len() as f64 / elapsed * 60_000.0;

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance = (intervals.iter().map(|d| (d - mean).powi(2)).sum::<f64>()
            / intervals.len() as f64)
            .sqrt();

        let max = intervals.iter().cloned().fold(0.0_f64, f64::max);
        let profile = intervals.iter().map(|d| d / max).collect();

        let sample = TypingProfile {
            speed,
            variance,
            profile,
            samples: 1,
        };
        ensure_finite(&sample)?;
        Ok(sample)
    }

    /// Fold a fresh single sample into a stored profile.
    ///
    /// History weight is `min(n, cap) / (min(n, cap) + 1)`, so the newest
    /// sample never moves the scalars by more than `1 / (cap + 1)` once the
    /// history is full. The shape vector is replaced by the incoming one.
    pub fn blend(&self, existing: &TypingProfile, incoming: &TypingProfile) -> TypingProfile {
        if existing.is_empty() {
            return TypingProfile {
                samples: 1,
                ..incoming.clone()
            };
        }

        let n = existing.samples.min(self.policy.history_cap) as f64;
        let w = n / (n + 1.0);

        TypingProfile {
            speed: w * existing.speed + (1.0 - w) * incoming.speed,
            variance: w * existing.variance + (1.0 - w) * incoming.variance,
            profile: incoming.profile.clone(),
            samples: existing.samples.saturating_add(1),
        }
    }

    /// Similarity of a fresh sample to the stored profile, in `[0, 1]`
    pub fn score(&self, stored: &TypingProfile, current: &TypingProfile) -> f64 {
        self.policy.speed_weight * scalar_similarity(stored.speed, current.speed)
            + self.policy.variance_weight * scalar_similarity(stored.variance, current.variance)
            + self.policy.profile_weight * cosine_similarity(&stored.profile, &current.profile)
    }

    /// Judge one capture against the stored profile.
    ///
    /// Never fails: every path that cannot produce a meaningful score is a
    /// neutral pass.
    pub fn evaluate(&self, stored: Option<&TypingProfile>, events: &[KeyEvent]) -> TypingVerdict {
        match self.try_evaluate(stored, events) {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(error = %e, "Typing analysis failed, passing neutrally");
                neutral(stored)
            }
        }
    }

    fn try_evaluate(
        &self,
        stored: Option<&TypingProfile>,
        events: &[KeyEvent],
    ) -> Result<TypingVerdict> {
        let sample = self.try_record_sample(events)?;

        if sample.is_empty() {
            return Ok(neutral(stored));
        }

        let stored = match stored {
            Some(p) if !p.is_empty() => p,
            _ => {
                // First capture enrolls
                return Ok(TypingVerdict {
                    accepted: true,
                    confidence: NEUTRAL_CONFIDENCE,
                    profile: sample,
                });
            }
        };

        let score = self.score(stored, &sample);
        if !score.is_finite() {
            return Err(Error::Internal("Typing score is not finite".into()));
        }

        let profile = self.blend(stored, &sample);
        ensure_finite(&profile)?;

        Ok(TypingVerdict {
            accepted: score > self.policy.accept_threshold,
            confidence: score,
            profile,
        })
    }
}

fn neutral(stored: Option<&TypingProfile>) -> TypingVerdict {
    TypingVerdict {
        accepted: true,
        confidence: NEUTRAL_CONFIDENCE,
        profile: stored.cloned().unwrap_or_default(),
    }
}

fn ensure_finite(profile: &TypingProfile) -> Result<()> {
    let finite = profile.speed.is_finite()
        && profile.variance.is_finite()
        && profile.profile.iter().all(|v| v.is_finite());
    if finite {
        Ok(())
    } else {
        Err(Error::Internal("Non-finite typing statistics".into()))
    }
}

/// `max(0, 1 - |a-b| / max(a,b))`, or 0 when both are 0
fn scalar_similarity(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max <= 0.0 {
        return 0.0;
    }
    (1.0 - (a - b).abs() / max).max(0.0)
}

/// Cosine similarity over the common prefix of two vectors
fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
