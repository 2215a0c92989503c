//! Lexicographically sortable identifiers.
//!
//! An [`Identifier`] is a 26-character Crockford Base32 string: a 10-char
//! millisecond timestamp component followed by 16 chars of randomness,
//! the same shape as a ULID. Sorting identifiers as strings sorts them
//! by creation time.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

const ENCODING: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";
const ENCODED_LEN: usize = 26;
const TIMESTAMP_LEN: usize = 10;

/// How far the wall clock is allowed to move backward between successive
/// [`Identifier::generate`] calls before it's treated as a real clock
/// rewind rather than ordinary NTP jitter.
pub const DEFAULT_CLOCK_REWIND_SLACK_MS: u64 = 50;

/// Errors raised while generating or parsing an [`Identifier`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier must be exactly {ENCODED_LEN} characters, got {0}")]
    WrongLength(usize),

    #[error("identifier contains a character outside the Crockford Base32 alphabet: {0:?}")]
    InvalidCharacter(char),

    #[error("system clock is behind the last generated timestamp by {0}ms")]
    ClockRewind(u64),
}

/// A 26-character, time-sortable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier([u8; ENCODED_LEN]);

impl Identifier {
    /// Generate a new identifier from the current wall-clock time,
    /// tolerating up to [`DEFAULT_CLOCK_REWIND_SLACK_MS`] of backward clock
    /// movement relative to `last_timestamp_ms`.
    ///
    /// Returns [`IdentifierError::ClockRewind`] if `last_timestamp_ms` is
    /// supplied and the current time is earlier than it by more than the
    /// slack — callers that track monotonicity (e.g. a per-process
    /// generator) should treat this as transient and retry rather than
    /// panic.
    pub fn generate(last_timestamp_ms: Option<u64>) -> Result<Self, IdentifierError> {
        Self::generate_with_slack(last_timestamp_ms, DEFAULT_CLOCK_REWIND_SLACK_MS)
    }

    /// As [`Self::generate`], but with an explicit clock-rewind slack
    /// instead of the default.
    pub fn generate_with_slack(last_timestamp_ms: Option<u64>, slack_ms: u64) -> Result<Self, IdentifierError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64;

        if let Some(last) = last_timestamp_ms {
            if last > now_ms {
                let rewind = last - now_ms;
                if rewind > slack_ms {
                    return Err(IdentifierError::ClockRewind(rewind));
                }
            }
        }

        let mut random = [0u8; 10];
        rand::rng().fill_bytes(&mut random);
        Ok(Self::from_parts(now_ms, &random))
    }

    fn from_parts(timestamp_ms: u64, random: &[u8; 10]) -> Self {
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate().take(TIMESTAMP_LEN) {
            let shift = (TIMESTAMP_LEN - 1 - i) * 5;
            let idx = ((timestamp_ms >> shift) & 0x1f) as usize;
            *slot = ENCODING[idx];
        }

        // 10 bytes of randomness packed as an 80-bit integer, encoded 5 bits at a time.
        let mut bits: u128 = 0;
        for &b in random {
            bits = (bits << 8) | b as u128;
        }
        for (i, slot) in out.iter_mut().enumerate().skip(TIMESTAMP_LEN) {
            let shift = (ENCODED_LEN - 1 - i) * 5;
            let idx = ((bits >> shift) & 0x1f) as usize;
            *slot = ENCODING[idx];
        }

        Self(out)
    }

    /// Validate that `s` is a well-formed identifier without constructing one.
    pub fn validate(s: &str) -> Result<(), IdentifierError> {
        Self::parse(s).map(|_| ())
    }

    /// Parse an identifier from its string form.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        if s.len() != ENCODED_LEN {
            return Err(IdentifierError::WrongLength(s.len()));
        }
        let mut out = [0u8; ENCODED_LEN];
        for (i, c) in s.chars().enumerate() {
            let lower = c.to_ascii_lowercase();
            if !ENCODING.contains(&(lower as u8)) {
                return Err(IdentifierError::InvalidCharacter(c));
            }
            out[i] = lower as u8;
        }
        Ok(Self(out))
    }

    /// Extract the millisecond timestamp this identifier was generated at.
    pub fn timestamp_ms(&self) -> u64 {
        let mut ts: u64 = 0;
        for &byte in &self.0[..TIMESTAMP_LEN] {
            let idx = ENCODING.iter().position(|&e| e == byte).unwrap_or(0) as u64;
            ts = (ts << 5) | idx;
        }
        ts
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: `self.0` is always built from bytes in `ENCODING`, which is ASCII.
        std::str::from_utf8(&self.0).expect("identifier bytes are always valid ASCII")
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identifier_has_correct_length_and_alphabet() {
        let id = Identifier::generate(None).unwrap();
        assert_eq!(id.as_str().len(), ENCODED_LEN);
        assert!(id.as_str().bytes().all(|b| ENCODING.contains(&b)));
    }

    #[test]
    fn parse_roundtrips_display() {
        let id = Identifier::generate(None).unwrap();
        let parsed = Identifier::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            Identifier::parse("short"),
            Err(IdentifierError::WrongLength(5))
        );
    }

    #[test]
    fn parse_rejects_invalid_characters() {
        // 'i', 'l', 'o', 'u' are excluded from Crockford Base32.
        let bad = "i".repeat(ENCODED_LEN);
        assert!(matches!(
            Identifier::parse(&bad),
            Err(IdentifierError::InvalidCharacter('i'))
        ));
    }

    #[test]
    fn parse_is_case_insensitive() {
        let id = Identifier::generate(None).unwrap();
        let upper = id.to_string().to_uppercase();
        assert_eq!(Identifier::parse(&upper).unwrap(), id);
    }

    #[test]
    fn successive_identifiers_sort_lexicographically_by_time() {
        let a = Identifier::from_parts(1_000, &[0; 10]);
        let b = Identifier::from_parts(1_001, &[0; 10]);
        assert!(a < b);
    }

    #[test]
    fn timestamp_extraction_roundtrips() {
        let ts = 1_700_000_000_123u64;
        let id = Identifier::from_parts(ts, &[7; 10]);
        assert_eq!(id.timestamp_ms(), ts);
    }

    #[test]
    fn generate_rejects_clock_rewind_beyond_slack() {
        let far_future = u64::MAX / 2;
        let err = Identifier::generate(Some(far_future)).unwrap_err();
        assert!(matches!(err, IdentifierError::ClockRewind(_)));
    }

    #[test]
    fn generate_tolerates_clock_rewind_within_slack() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        // A "last" timestamp a few ms ahead of now, within the default
        // 50ms slack, must not be treated as a rewind.
        assert!(Identifier::generate(Some(now_ms + 10)).is_ok());
    }

    #[test]
    fn generate_with_slack_rejects_rewind_past_the_explicit_slack() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert!(Identifier::generate_with_slack(Some(now_ms + 5), 1).is_err());
        assert!(Identifier::generate_with_slack(Some(now_ms + 5), 100).is_ok());
    }

    #[test]
    fn two_identifiers_with_same_timestamp_are_not_equal() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let a = Identifier::from_parts(now, &[1; 10]);
        let b = Identifier::from_parts(now, &[2; 10]);
        assert_ne!(a, b);
    }
}
