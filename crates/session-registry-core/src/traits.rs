//! Core traits for the backing store and the host-facing mapping.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{SessionToken, StoreEndpoint};

/// Result of a backing store call that fails soft.
///
/// `Unavailable` means the shared store could not be reached (or answered
/// garbage). It is distinct from `Success(None)`, which is a
/// confirmed absence.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    /// The shared store answered.
    Success(T),
    /// The shared store could not be used; the caller falls back.
    Unavailable,
}

impl<T> Outcome<T> {
    /// Whether the shared store answered.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Convert into an `Option`, dropping the unavailable case.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Unavailable => None,
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Unavailable => Outcome::Unavailable,
        }
    }
}

/// Failure talking to the shared store.
///
/// Every variant is transient and is recovered locally via fallback.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Credential rejected: {0}")]
    Auth(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Store unreachable")]
    Unreachable,
}

impl StoreError {
    /// Whether the store answered with something we could not understand.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// An established connection to the shared key-value store.
///
/// Implementations must be safe to share across tasks; the store itself
/// serializes concurrent writes to the same key.
#[async_trait]
pub trait KvConnection: Send + Sync {
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Fetch a value. Absent and expired keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value with a lifetime in seconds.
    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Test a key for existence.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Establishes connections to the shared store.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open and authenticate a connection.
    async fn dial(&self, endpoint: &StoreEndpoint) -> Result<Arc<dyn KvConnection>, StoreError>;
}

/// Mapping-shaped session storage, as seen by the host.
///
/// All operations are synchronous and never fail for store-related
/// reasons; invalid tokens are rejected earlier, when the host builds a
/// `SessionToken`.
pub trait SessionMap: Send + Sync {
    /// Membership test.
    fn contains(&self, token: &SessionToken) -> bool;

    /// Item read.
    fn read(&self, token: &SessionToken) -> Option<Value>;

    /// Item write.
    fn write(&self, token: &SessionToken, payload: Value);

    /// Item delete (best-effort).
    fn remove(&self, token: &SessionToken);

    /// Identity of the registry behind this map, if it is one.
    ///
    /// Used to keep installation idempotent.
    fn registry_id(&self) -> Option<Uuid> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_helpers() {
        let hit: Outcome<Option<u8>> = Outcome::Success(Some(1));
        assert!(hit.is_success());
        assert_eq!(hit.map(|v| v.map(|n| n + 1)), Outcome::Success(Some(2)));

        let down: Outcome<Option<u8>> = Outcome::Unavailable;
        assert!(!down.is_success());
        assert_eq!(down.success(), None);
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Protocol("bad".into()).is_protocol());
        assert!(!StoreError::Unreachable.is_protocol());
    }

    struct Refusing;

    #[async_trait]
    impl Dialer for Refusing {
        async fn dial(&self, endpoint: &StoreEndpoint) -> Result<Arc<dyn KvConnection>, StoreError> {
            Err(StoreError::Connect(endpoint.address()))
        }
    }

    #[test]
    fn test_dialer_object_safety() {
        let dialer: Arc<dyn Dialer> = Arc::new(Refusing);
        let endpoint: StoreEndpoint = "redis://cache:6380".parse().unwrap();
        let err = tokio_test::block_on(dialer.dial(&endpoint)).err().unwrap();
        assert_eq!(err.to_string(), "Connect failed: cache:6380");
    }

    struct Empty;

    impl SessionMap for Empty {
        fn contains(&self, _token: &SessionToken) -> bool {
            false
        }

        fn read(&self, _token: &SessionToken) -> Option<Value> {
            None
        }

        fn write(&self, _token: &SessionToken, _payload: Value) {}

        fn remove(&self, _token: &SessionToken) {}
    }

    #[test]
    fn test_plain_maps_have_no_registry_id() {
        assert_eq!(Empty.registry_id(), None);
    }
}
