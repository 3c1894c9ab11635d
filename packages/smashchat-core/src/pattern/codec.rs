//! Pattern normalization, digesting and similarity.
//!
//! A raw SMASH pattern is a flat list of scalars `[x0, y0, x1, y1, ...]`
//! captured from a gesture or keystroke grid. Before anything is hashed it is
//! folded onto a coarse integer grid so that the digest is stable across
//! devices with different sampling precision:
//!
//! ```text
//!   raw (f64, 0..=10000)  ──►  v mod 1000  ──►  / 10  ──►  round  ──►  grid (0..=100)
//! ```
//!
//! The grid sequence is joined into a canonical string and stretched with
//! PBKDF2-HMAC-SHA512 under a per-credential salt.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Minimum number of points in a pattern
pub const MIN_POINTS: usize = 3;

/// Maximum number of points accepted (bounds the digest work per request)
pub const MAX_POINTS: usize = 4096;

/// Largest raw coordinate accepted
pub const MAX_COORDINATE: f64 = 10_000.0;

/// PBKDF2 iteration count
pub const DIGEST_ITERATIONS: u32 = 10_000;

/// Digest output length in bytes (512 bits)
pub const DIGEST_LEN: usize = 64;

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// Grid distance at which similarity drops to zero
pub const SIMILARITY_TOLERANCE: f64 = 10.0;

/// One normalized pattern point on the integer grid
pub type GridPoint = (i64, i64);

/// Check that a raw pattern is well formed.
///
/// This is a pure precondition: callers must run it before
/// [`normalize`] / [`digest`] so malformed input never reaches the KDF.
pub fn validate_format(raw: &[f64]) -> Result<()> {
    if raw.len() < MIN_POINTS * 2 {
        return Err(Error::FormatError(format!(
            "Pattern must contain at least {} points",
            MIN_POINTS
        )));
    }
    if raw.len() % 2 != 0 {
        return Err(Error::FormatError(
            "Pattern must contain an even number of coordinates".into(),
        ));
    }
    if raw.len() > MAX_POINTS * 2 {
        return Err(Error::FormatError(format!(
            "Pattern must contain at most {} points",
            MAX_POINTS
        )));
    }
    if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
        return Err(Error::FormatError(format!(
            "Coordinate {} is not a finite number",
            index
        )));
    }
    if let Some(index) = raw.iter().position(|v| *v < 0.0 || *v > MAX_COORDINATE) {
        return Err(Error::FormatError(format!(
            "Coordinate {} is outside [0, {}]",
            index, MAX_COORDINATE
        )));
    }
    Ok(())
}

fn to_grid(value: f64) -> i64 {
    (value.rem_euclid(1000.0) / 10.0).round() as i64
}

/// Fold a raw pattern onto the integer grid.
///
/// A trailing unpaired scalar is ignored; [`validate_format`] rejects such
/// input before it gets here.
pub fn normalize(raw: &[f64]) -> Vec<GridPoint> {
    raw.chunks_exact(2)
        .map(|pair| (to_grid(pair[0]), to_grid(pair[1])))
        .collect()
}

/// Canonical string form of a normalized pattern: `"x0,y0,x1,y1,..."`.
pub fn canonical_string(normalized: &[GridPoint]) -> String {
    normalized
        .iter()
        .map(|(x, y)| format!("{},{}", x, y))
        .collect::<Vec<_>>()
        .join(",")
}

/// Salted, stretched digest of a normalized pattern (lowercase hex).
///
/// Deterministic for a given `(normalized, salt)` pair.
pub fn digest(normalized: &[GridPoint], salt: &str) -> String {
    let canonical = canonical_string(normalized);
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha512>(
        canonical.as_bytes(),
        salt.as_bytes(),
        DIGEST_ITERATIONS,
        &mut out,
    );
    hex::encode(out)
}

/// Generate a fresh random salt (hex encoded).
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of two hex digests.
pub fn digests_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Fuzzy similarity of two raw patterns in `[0, 1]`.
///
/// Both patterns are normalized; if their point counts differ (or either is
/// empty) the result is `0.0`. Otherwise the mean Euclidean distance between
/// corresponding grid points is mapped through
/// `max(0, 1 - mean / SIMILARITY_TOLERANCE)`.
pub fn similarity(a: &[f64], b: &[f64]) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let total: f64 = a
        .iter()
        .zip(&b)
        .map(|((ax, ay), (bx, by))| {
            let dx = (ax - bx) as f64;
            let dy = (ay - by) as f64;
            (dx * dx + dy * dy).sqrt()
        })
        .sum();
    let mean = total / a.len() as f64;

    (1.0 - mean / SIMILARITY_TOLERANCE).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: [f64; 6] = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];

    #[test]
    fn test_validate_accepts_minimal_pattern() {
        assert!(validate_format(&PATTERN).is_ok());
    }

    #[test]
    fn test_validate_rejects_short_pattern() {
        let err = validate_format(&[1.0, 2.0, 3.0, 4.0]).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
    }

    #[test]
    fn test_validate_rejects_odd_length() {
        let err = validate_format(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
    }

    #[test]
    fn test_validate_rejects_non_finite_and_out_of_range() {
        let mut nan = PATTERN;
        nan[3] = f64::NAN;
        assert!(validate_format(&nan).is_err());

        let mut inf = PATTERN;
        inf[0] = f64::INFINITY;
        assert!(validate_format(&inf).is_err());

        let mut negative = PATTERN;
        negative[1] = -1.0;
        assert!(validate_format(&negative).is_err());

        let mut large = PATTERN;
        large[5] = 10_000.5;
        assert!(validate_format(&large).is_err());

        let mut edge = PATTERN;
        edge[5] = 10_000.0;
        assert!(validate_format(&edge).is_ok());
    }

    #[test]
    fn test_normalize_folds_onto_grid() {
        assert_eq!(normalize(&PATTERN), vec![(1, 2), (3, 4), (5, 6)]);
        // 1234 mod 1000 = 234 -> 23.4 -> 23 ; 9995 mod 1000 = 995 -> 99.5 -> 100
        assert_eq!(normalize(&[1234.0, 9995.0]), vec![(23, 100)]);
    }

    #[test]
    fn test_digest_is_deterministic() {
        let normalized = normalize(&PATTERN);
        let d1 = digest(&normalized, "abc");
        let d2 = digest(&normalized, "abc");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), DIGEST_LEN * 2);
    }

    #[test]
    fn test_equivalent_patterns_share_a_digest() {
        // Both fold onto the same grid sequence
        let a = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
        let b = [1010.0, 2021.0, 30.4, 1040.0, 49.6, 3060.0];
        assert_eq!(normalize(&a), normalize(&b));
        assert_eq!(digest(&normalize(&a), "abc"), digest(&normalize(&b), "abc"));
    }

    #[test]
    fn test_salt_changes_digest() {
        let normalized = normalize(&PATTERN);
        assert_ne!(digest(&normalized, "abc"), digest(&normalized, "abd"));
    }

    #[test]
    fn test_generated_salts_are_unique() {
        let s1 = generate_salt();
        let s2 = generate_salt();
        assert_eq!(s1.len(), SALT_LEN * 2);
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_digests_equal() {
        assert!(digests_equal("abcd", "abcd"));
        assert!(!digests_equal("abcd", "abce"));
        assert!(!digests_equal("abcd", "abc"));
    }

    #[test]
    fn test_similarity_identical_is_one() {
        assert_eq!(similarity(&PATTERN, &PATTERN), 1.0);
    }

    #[test]
    fn test_similarity_different_lengths_is_zero() {
        let longer = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0];
        assert_eq!(similarity(&PATTERN, &longer), 0.0);
        assert_eq!(similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_similarity_degrades_with_distance() {
        // Every point moved by 3 grid units on x: mean distance 3 -> 0.7
        let shifted = [40.0, 20.0, 60.0, 40.0, 80.0, 60.0];
        let score = similarity(&PATTERN, &shifted);
        assert!((score - 0.7).abs() < 1e-9, "score = {}", score);

        // Far away: clamped at zero
        let far = [900.0, 900.0, 900.0, 900.0, 900.0, 900.0];
        assert_eq!(similarity(&PATTERN, &far), 0.0);
    }
}
