//! In-process shared key-value backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use session_registry_core::{Dialer, KvConnection, StoreEndpoint, StoreError};
use tokio::time::Instant;

struct Inner {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    reachable: AtomicBool,
    dials: AtomicU64,
    dial_delay: Duration,
    op_delay: Duration,
}

/// In-memory stand-in for the shared store.
///
/// Useful for development and tests: clones share the same data, so
/// several registries built on clones of one backend behave like separate
/// process instances talking to one store. Reachability can be toggled to
/// simulate an outage.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty, reachable backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                dials: AtomicU64::new(0),
                dial_delay: Duration::ZERO,
                op_delay: Duration::ZERO,
            }),
        }
    }

    /// Make every dial take `delay` before completing.
    #[must_use]
    pub fn with_dial_delay(self, delay: Duration) -> Self {
        self.with_delays(delay, self.inner.op_delay)
    }

    /// Make every command take `delay` before it is answered.
    #[must_use]
    pub fn with_op_delay(self, delay: Duration) -> Self {
        self.with_delays(self.inner.dial_delay, delay)
    }

    fn with_delays(&self, dial_delay: Duration, op_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(self.entries().clone()),
                reachable: AtomicBool::new(self.inner.reachable.load(Ordering::SeqCst)),
                dials: AtomicU64::new(self.dial_count()),
                dial_delay,
                op_delay,
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of dial attempts seen.
    #[must_use]
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Unexpired keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Raw value of a key, bypassing reachability.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    /// Write a raw value, bypassing reachability.
    pub fn inject(&self, key: &str, value: &str, ttl: Duration) {
        self.entries()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer(&self) -> Result<(), StoreError> {
        if !self.inner.op_delay.is_zero() {
            tokio::time::sleep(self.inner.op_delay).await;
        }
        self.check_reachable()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable)
        }
    }
}

#[async_trait]
impl KvConnection for MemoryBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        self.answer().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.answer().await?;
        let now = Instant::now();
        let mut entries = self.entries();
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), StoreError> {
        self.answer().await?;
        self.inject(key, value, Duration::from_secs(ttl_seconds));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.answer().await?;
        let now = Instant::now();
        Ok(self
            .entries()
            .remove(key)
            .is_some_and(|(_, expires_at)| expires_at > now))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.answer().await?;
        Ok(self.peek(key).is_some())
    }
}

#[async_trait]
impl Dialer for MemoryBackend {
    async fn dial(&self, _endpoint: &StoreEndpoint) -> Result<Arc<dyn KvConnection>, StoreError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if !self.inner.dial_delay.is_zero() {
            tokio::time::sleep(self.inner.dial_delay).await;
        }
        self.check_reachable()?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_enforced_by_backend() {
        let backend = MemoryBackend::new();
        backend.set_ex("k", 1, "v").await.unwrap();
        assert!(backend.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_rejects_calls() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        assert!(matches!(backend.ping().await, Err(StoreError::Unreachable)));
        assert!(backend.get("k").await.is_err());

        let endpoint: StoreEndpoint = "redis://localhost".parse().unwrap();
        assert!(backend.dial(&endpoint).await.is_err());
        assert_eq!(backend.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let a = MemoryBackend::new();
        let b = a.clone();
        a.set_ex("shared", 60, "1").await.unwrap();
        assert_eq!(b.get("shared").await.unwrap().as_deref(), Some("1"));
        assert!(b.del("shared").await.unwrap());
        assert!(!a.exists("shared").await.unwrap());
    }
}
