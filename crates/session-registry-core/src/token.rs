//! Session tokens.

use std::{fmt, str::FromStr};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on token length, in bytes.
pub const MAX_TOKEN_LEN: usize = 256;

/// Rejected token input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Session token is empty")]
    Empty,
    #[error("Session token exceeds {MAX_TOKEN_LEN} bytes ({0} bytes)")]
    TooLong(usize),
    #[error("Session token contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque session identifier.
///
/// Only characters from the URL-safe alphabet (`A-Z a-z 0-9 - _`) are
/// accepted, so a token can be embedded in headers, URLs and store keys
/// without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    /// Validate and wrap a token string.
    ///
    /// # Errors
    /// Returns error if the input is empty, too long, or not URL-safe.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TokenError::Empty);
        }
        if raw.len() > MAX_TOKEN_LEN {
            return Err(TokenError::TooLong(raw.len()));
        }
        if let Some(bad) = raw.chars().find(|c| !is_url_safe(*c)) {
            return Err(TokenError::InvalidChar(bad));
        }
        Ok(Self(raw))
    }

    /// Borrow the token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

const fn is_url_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Generate a fresh, unpredictable session token.
///
/// 122 random bits from a v4 UUID, encoded as 22 characters of unpadded
/// URL-safe base64. Collisions are not checked.
#[must_use]
pub fn create_token() -> SessionToken {
    SessionToken(URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()))
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for SessionToken {
    type Error = TokenError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_create_token_unique_and_url_safe() {
        let mut seen = HashSet::with_capacity(10_000);
        for _ in 0..10_000 {
            let token = create_token();
            assert_eq!(token.as_str().len(), 22);
            assert!(token.as_str().chars().all(is_url_safe));
            assert!(seen.insert(token), "duplicate token generated");
        }
    }

    #[test]
    fn test_parse_accepts_uuid_and_plain_ids() {
        assert!(SessionToken::parse("abc").is_ok());
        assert!(SessionToken::parse(Uuid::new_v4().to_string()).is_ok());
        assert!(SessionToken::parse("a_b-C9").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(SessionToken::parse(""), Err(TokenError::Empty));
        assert_eq!(
            SessionToken::parse("has space"),
            Err(TokenError::InvalidChar(' '))
        );
        assert_eq!(
            SessionToken::parse("ns:key"),
            Err(TokenError::InvalidChar(':'))
        );
        let long = "a".repeat(MAX_TOKEN_LEN + 1);
        assert_eq!(
            SessionToken::parse(long),
            Err(TokenError::TooLong(MAX_TOKEN_LEN + 1))
        );
    }

    #[test]
    fn test_serde_validates() {
        let token: SessionToken = serde_json::from_str("\"k1\"").unwrap();
        assert_eq!(token.as_str(), "k1");
        assert!(serde_json::from_str::<SessionToken>("\"bad token\"").is_err());
    }
}
