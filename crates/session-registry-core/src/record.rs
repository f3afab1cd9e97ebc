//! Session record envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SessionToken;

/// Persisted session data.
///
/// This is what the shared store holds under a session key. The store
/// enforces expiry on its own; `created_at` and `ttl_seconds` travel with
/// the record so a copy cached locally never outlives the shared one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session token this record belongs to.
    pub session_token: SessionToken,
    /// Arbitrary host payload.
    pub payload: Value,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Time to live in seconds.
    pub ttl_seconds: u64,
}

impl SessionRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(session_token: SessionToken, payload: Value, ttl_seconds: u64) -> Self {
        Self {
            session_token,
            payload,
            created_at: now(),
            ttl_seconds,
        }
    }

    /// Seconds left before expiry at `at`, or `None` if already expired.
    #[must_use]
    pub fn remaining_ttl(&self, at: i64) -> Option<u64> {
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        let left = self.created_at.saturating_add(ttl).saturating_sub(at);
        u64::try_from(left).ok().filter(|secs| *secs > 0)
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a record read from the store.
    ///
    /// # Errors
    /// Returns error if the text is not a valid record.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
