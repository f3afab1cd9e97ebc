//! Session store: the registry the host talks to.
//!
//! The host sees a synchronous map. Every call is served from the local
//! store without suspending; the shared store is kept in step by background
//! tasks spawned onto the Tokio runtime the registry was built on:
//!
//! - writes and removals go to the local store, then propagate to the
//!   shared store; one task per token sends its latest change, so the
//!   shared copy always ends up matching the last local change;
//! - local misses (and stale local copies) schedule a reconciliation that
//!   pulls the shared record into the local store;
//! - hosts that can await use [`SessionStore::load`] for a bounded
//!   round trip to the shared store.
//!
//! When the shared store cannot be reached the registry keeps working as a
//! single-instance map. Every switch between shared and degraded operation
//! is logged and published through [`SessionStore::subscribe_mode`].

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use session_registry_core::{
    ConfigError, Dialer, Outcome, RegistryConfig, SessionMap, SessionRecord, SessionToken,
    create_token, record::now,
};
use tokio::{
    runtime::Handle,
    sync::{Notify, watch},
};
use uuid::Uuid;

use crate::{
    client::{BackingClient, ClientOptions, TcpDialer},
    storage::{LocalStore, Pending},
};

/// Expired local entries are swept once every this many writes.
const PURGE_EVERY: u64 = 256;

/// Where sessions are currently served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Shared store configured, not contacted yet.
    Pending,
    /// Shared store reachable; sessions are visible to every instance.
    Shared,
    /// Shared store unreachable; sessions are visible to this instance only.
    Degraded,
    /// No shared store configured.
    LocalOnly,
}

impl StoreMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Shared => "shared",
            Self::Degraded => "degraded",
            Self::LocalOnly => "local_only",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which copy answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Shared,
}

/// Result of an awaited lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Session found.
    Found { payload: Value, source: Source },
    /// Confirmed absent (by the shared store, or no shared store exists).
    Absent,
    /// Shared store unreachable and nothing held locally.
    Unavailable,
}

impl ReadOutcome {
    /// Payload, if found.
    #[must_use]
    pub fn payload(self) -> Option<Value> {
        match self {
            Self::Found { payload, .. } => Some(payload),
            Self::Absent | Self::Unavailable => None,
        }
    }
}

struct Remote {
    client: BackingClient,
    runtime: Handle,
}

struct Inner {
    id: Uuid,
    config: RegistryConfig,
    remote: Option<Remote>,
    local: LocalStore,
    mode: watch::Sender<StoreMode>,
    reconciling: Mutex<HashSet<SessionToken>>,
    propagating: Mutex<HashSet<SessionToken>>,
    writes: AtomicU64,
    inflight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight counter when a background task ends.
struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Distributed session registry with local fallback.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("id", &self.inner.id)
            .field("mode", &self.mode())
            .field("namespace", &self.inner.config.key_namespace)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Create a registry that reaches the shared store over TCP.
    ///
    /// Must be called from within a Tokio runtime for the shared store to
    /// be used; background work runs on that runtime. Nothing is dialed
    /// until first use.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn new(config: RegistryConfig) -> Result<Self, ConfigError> {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    /// Create a registry with a custom dialer.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn with_dialer(config: RegistryConfig, dialer: Arc<dyn Dialer>) -> Result<Self, ConfigError> {
        config.validate()?;

        let remote = match (config.endpoint()?, Handle::try_current()) {
            (None, _) => {
                tracing::info!("No shared store configured; sessions are visible to this instance only");
                None
            }
            (Some(endpoint), Err(_)) => {
                tracing::warn!(
                    %endpoint,
                    "No Tokio runtime available; shared store disabled, sessions are visible to this instance only"
                );
                None
            }
            (Some(endpoint), Ok(runtime)) => {
                let options = ClientOptions {
                    op_timeout: config.op_timeout(),
                    retry_cooldown: config.retry_cooldown(),
                    debug: config.debug_enabled,
                };
                Some(Remote {
                    client: BackingClient::new(endpoint, dialer, options),
                    runtime,
                })
            }
        };

        let initial = if remote.is_some() {
            StoreMode::Pending
        } else {
            StoreMode::LocalOnly
        };
        let (mode, _) = watch::channel(initial);

        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                config,
                remote,
                local: LocalStore::new(),
                mode,
                reconciling: Mutex::new(HashSet::new()),
                propagating: Mutex::new(HashSet::new()),
                writes: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Identity of this registry instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Current serving mode.
    #[must_use]
    pub fn mode(&self) -> StoreMode {
        *self.inner.mode.borrow()
    }

    /// Watch mode transitions.
    #[must_use]
    pub fn subscribe_mode(&self) -> watch::Receiver<StoreMode> {
        self.inner.mode.subscribe()
    }

    /// Backing client, when a shared store is configured.
    #[must_use]
    pub fn client(&self) -> Option<&BackingClient> {
        self.inner.remote.as_ref().map(|r| &r.client)
    }

    /// Generate a fresh session token.
    #[must_use]
    pub fn create_token(&self) -> SessionToken {
        create_token()
    }

    /// Connect to the shared store if not done yet.
    ///
    /// Single-flight: concurrent callers share one dial attempt and all see
    /// its outcome. Returns whether the shared store is in use.
    pub async fn initialize(&self) -> bool {
        let Some(remote) = &self.inner.remote else {
            return false;
        };
        let outcome = remote.client.connect().await;
        self.record(&outcome);
        outcome.is_success()
    }

    /// Membership test. Never suspends.
    #[must_use]
    pub fn contains(&self, token: &SessionToken) -> bool {
        if self.inner.local.contains(token) {
            return true;
        }
        self.schedule_reconcile(token);
        false
    }

    /// Item read. Never suspends.
    ///
    /// A local miss returns `None` and schedules a background lookup, so a
    /// session written by another instance becomes visible on a later call.
    #[must_use]
    pub fn read(&self, token: &SessionToken) -> Option<Value> {
        let Some(entry) = self.inner.local.get(token) else {
            self.schedule_reconcile(token);
            return None;
        };
        if entry.synced && entry.stored_at.elapsed() >= self.inner.config.refresh_after() {
            self.schedule_reconcile(token);
        }
        Some(entry.payload)
    }

    /// Item write. Never suspends; the shared copy is updated in the
    /// background.
    pub fn write(&self, token: &SessionToken, payload: Value) {
        self.inner
            .local
            .insert(token.clone(), payload, now(), self.inner.config.ttl());

        if self.inner.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.inner.local.purge_expired();
        }
        self.schedule_propagate(token);
    }

    /// Item delete, best-effort. Never suspends.
    pub fn remove(&self, token: &SessionToken) {
        if self.inner.remote.is_none() {
            self.inner.local.remove(token);
            return;
        }
        self.inner
            .local
            .tombstone(token.clone(), self.inner.config.ttl());
        self.schedule_propagate(token);
    }

    /// Look a session up in the shared store, bounded by the operation
    /// timeout, refreshing the local copy.
    ///
    /// Falls back to the local copy when the shared store is unreachable.
    /// Dropping the returned future does not cancel the underlying call.
    pub async fn load(&self, token: &SessionToken) -> ReadOutcome {
        if self.inner.remote.is_none() {
            return self.local_outcome(token);
        }
        let this = self.clone();
        let owned = token.clone();
        self.detached(async move { this.reconcile(&owned).await })
            .await
            .unwrap_or_else(|| self.fallback_outcome(token))
    }

    /// Session id bound to `context_key`, creating and storing one if none
    /// exists. Falls back to a fresh, unstored token when the shared store
    /// is unavailable.
    pub async fn resolve_session_id(&self, context_key: &str) -> SessionToken {
        if self.inner.remote.is_none() {
            return create_token();
        }
        let this = self.clone();
        let key = self.session_id_key(context_key);
        self.detached(async move { this.resolve_key(&key).await })
            .await
            .unwrap_or_else(create_token)
    }

    /// Tokens held locally, sorted.
    #[must_use]
    pub fn local_tokens(&self) -> Vec<SessionToken> {
        self.inner.local.tokens()
    }

    /// Wait until every background task has finished.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Finish background work and drop the shared store connection.
    pub async fn shutdown(&self) {
        self.settle().await;
        if let Some(remote) = &self.inner.remote {
            remote.client.disconnect();
            tracing::info!(endpoint = %remote.client.endpoint(), "Shared session store connection closed");
        }
    }

    fn session_key(&self, token: &SessionToken) -> String {
        format!("{}:session:{token}", self.inner.config.key_namespace)
    }

    fn session_id_key(&self, context_key: &str) -> String {
        format!("{}:session_id:{context_key}", self.inner.config.key_namespace)
    }

    fn reconciling(&self) -> MutexGuard<'_, HashSet<SessionToken>> {
        self.inner
            .reconciling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn propagating(&self) -> MutexGuard<'_, HashSet<SessionToken>> {
        self.inner
            .propagating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the mode implied by a shared store outcome.
    ///
    /// A failed call on a connection that is still up (the call never got
    /// its turn) does not change the mode.
    fn record<T>(&self, outcome: &Outcome<T>) {
        let next = if outcome.is_success() {
            StoreMode::Shared
        } else if self.client().is_some_and(BackingClient::is_connected) {
            return;
        } else {
            StoreMode::Degraded
        };

        let mut previous = next;
        self.inner.mode.send_if_modified(|mode| {
            previous = *mode;
            if *mode == next {
                false
            } else {
                *mode = next;
                true
            }
        });

        match (previous, next) {
            (StoreMode::Degraded, StoreMode::Shared) => {
                tracing::info!(
                    namespace = %self.inner.config.key_namespace,
                    "Shared session store recovered; sessions are visible to all instances"
                );
                self.schedule_resync();
            }
            (StoreMode::Pending, StoreMode::Shared) => {
                tracing::info!(
                    namespace = %self.inner.config.key_namespace,
                    "Shared session store enabled"
                );
            }
            (StoreMode::Pending | StoreMode::Shared, StoreMode::Degraded) => {
                tracing::warn!(
                    from = %previous,
                    "Shared session store unavailable; serving sessions from local fallback, visible to this instance only"
                );
            }
            _ => {}
        }
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(remote) = &self.inner.remote else {
            return;
        };
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            inner: Arc::clone(&self.inner),
        };
        remote.runtime.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Run `task` on the runtime and await it. The task completes even if
    /// the caller goes away.
    async fn detached<T, F>(&self, task: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let remote = self.inner.remote.as_ref()?;
        match remote.runtime.spawn(task).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Session store task failed");
                None
            }
        }
    }

    fn schedule_reconcile(&self, token: &SessionToken) {
        if self.inner.remote.is_none() || !self.reconciling().insert(token.clone()) {
            return;
        }
        let this = self.clone();
        let token = token.clone();
        self.spawn_background(async move {
            this.reconcile(&token).await;
            this.reconciling().remove(&token);
        });
    }

    /// Start the propagation task for `token` unless one is running; a
    /// running task picks up the newer change itself.
    fn schedule_propagate(&self, token: &SessionToken) {
        if self.inner.remote.is_none() || !self.propagating().insert(token.clone()) {
            return;
        }
        let this = self.clone();
        let token = token.clone();
        self.spawn_background(async move {
            this.propagate(&token).await;
        });
    }

    /// One pass over changes made while degraded. Each token gets a single
    /// attempt; nothing is retried afterwards.
    fn schedule_resync(&self) {
        let pending = self.inner.local.unsynced();
        if pending.is_empty() {
            return;
        }
        tracing::info!(
            count = pending.len(),
            "Pushing sessions changed while degraded to the shared store"
        );
        for token in &pending {
            self.schedule_propagate(token);
        }
    }

    fn local_outcome(&self, token: &SessionToken) -> ReadOutcome {
        self.inner
            .local
            .read(token)
            .map_or(ReadOutcome::Absent, |payload| ReadOutcome::Found {
                payload,
                source: Source::Local,
            })
    }

    fn fallback_outcome(&self, token: &SessionToken) -> ReadOutcome {
        match self.local_outcome(token) {
            ReadOutcome::Absent => ReadOutcome::Unavailable,
            found => found,
        }
    }

    /// Send the latest local change to `token` until the shared store holds
    /// it. The exit check runs under the `propagating` lock, so a change
    /// made after it starts a new task.
    async fn propagate(&self, token: &SessionToken) {
        loop {
            let pending = {
                let mut running = self.propagating();
                match self.inner.local.pending(token) {
                    Some(pending) => pending,
                    None => {
                        running.remove(token);
                        return;
                    }
                }
            };
            if !self.send(token, pending).await {
                self.propagating().remove(token);
                return;
            }
        }
    }

    /// Apply one change to the shared store and confirm it locally.
    /// Returns whether the shared store accepted it.
    async fn send(&self, token: &SessionToken, pending: Pending) -> bool {
        let Some(remote) = &self.inner.remote else {
            return false;
        };
        let key = self.session_key(token);
        let (accepted, version) = match pending {
            Pending::Put {
                payload,
                created_at,
                ttl_seconds,
                version,
            } => {
                let record = SessionRecord {
                    session_token: token.clone(),
                    payload,
                    created_at,
                    ttl_seconds: self.inner.config.ttl_seconds,
                };
                let raw = match record.to_json() {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(%token, error = %e, "Session payload not serializable; kept locally");
                        return false;
                    }
                };
                let outcome = remote.client.set(&key, &raw, ttl_seconds).await;
                self.record(&outcome);
                (outcome.is_success(), version)
            }
            Pending::Delete { version } => {
                let outcome = remote.client.delete(&key).await;
                self.record(&outcome);
                (outcome.is_success(), version)
            }
        };
        if accepted {
            self.inner.local.mark_synced(token, version);
        }
        accepted
    }

    /// Pull the shared record for `token` into the local store.
    async fn reconcile(&self, token: &SessionToken) -> ReadOutcome {
        let Some(remote) = &self.inner.remote else {
            return self.local_outcome(token);
        };

        let expected = self.inner.local.version_of(token);
        let outcome = remote.client.get(&self.session_key(token)).await;
        self.record(&outcome);

        let Outcome::Success(raw) = outcome else {
            return self.fallback_outcome(token);
        };
        let Some(raw) = raw else {
            self.inner.local.reconcile(token, expected, None);
            return self.local_outcome(token);
        };

        let record = match SessionRecord::from_json(&raw) {
            Ok(record) if record.session_token == *token => record,
            Ok(_) | Err(_) => {
                tracing::warn!(%token, "Malformed session record in shared store; using local fallback");
                return self.fallback_outcome(token);
            }
        };

        let Some(left) = record.remaining_ttl(now()) else {
            self.inner.local.reconcile(token, expected, None);
            return self.local_outcome(token);
        };
        let adopted = self.inner.local.reconcile(
            token,
            expected,
            Some((
                record.payload.clone(),
                record.created_at,
                Duration::from_secs(left),
            )),
        );
        if adopted {
            ReadOutcome::Found {
                payload: record.payload,
                source: Source::Shared,
            }
        } else {
            self.local_outcome(token)
        }
    }

    async fn resolve_key(&self, key: &str) -> SessionToken {
        let Some(remote) = &self.inner.remote else {
            return create_token();
        };

        let existing = remote.client.get(key).await;
        self.record(&existing);
        if let Outcome::Success(Some(raw)) = &existing {
            match SessionToken::parse(raw.as_str()) {
                Ok(token) => return token,
                Err(e) => tracing::warn!(key, error = %e, "Ignoring malformed stored session id"),
            }
        }

        let token = create_token();
        if existing.is_success() {
            let stored = remote
                .client
                .set(key, token.as_str(), self.inner.config.ttl_seconds)
                .await;
            self.record(&stored);
        }
        token
    }
}

impl SessionMap for SessionStore {
    fn contains(&self, token: &SessionToken) -> bool {
        Self::contains(self, token)
    }

    fn read(&self, token: &SessionToken) -> Option<Value> {
        Self::read(self, token)
    }

    fn write(&self, token: &SessionToken, payload: Value) {
        Self::write(self, token, payload);
    }

    fn remove(&self, token: &SessionToken) {
        Self::remove(self, token);
    }

    fn registry_id(&self) -> Option<Uuid> {
        Some(self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryBackend;

    fn token(raw: &str) -> SessionToken {
        SessionToken::parse(raw).unwrap()
    }

    fn shared_config() -> RegistryConfig {
        RegistryConfig {
            store_endpoint: Some("redis://sessions.internal:6379".to_string()),
            key_namespace: "test".to_string(),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_only_without_endpoint() {
        let store = SessionStore::new(RegistryConfig::default()).unwrap();
        assert_eq!(store.mode(), StoreMode::LocalOnly);
        assert!(!store.initialize().await);

        store.write(&token("abc"), json!({"x": 1}));
        assert!(store.contains(&token("abc")));
        assert_eq!(store.read(&token("abc")), Some(json!({"x": 1})));
        assert_eq!(
            store.load(&token("missing")).await,
            ReadOutcome::Absent
        );
    }

    #[test]
    fn test_no_runtime_degrades_to_local() {
        let store = SessionStore::with_dialer(shared_config(), Arc::new(MemoryBackend::new()))
            .unwrap();
        assert_eq!(store.mode(), StoreMode::LocalOnly);
        assert!(store.client().is_none());
    }

    #[test]
    fn test_strict_mode_requires_endpoint() {
        let config = RegistryConfig {
            require_shared_store: true,
            ..RegistryConfig::default()
        };
        assert_eq!(
            SessionStore::new(config).unwrap_err(),
            ConfigError::MissingEndpoint
        );
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let backend = MemoryBackend::new();
        let store = SessionStore::with_dialer(shared_config(), Arc::new(backend.clone())).unwrap();

        store.write(&token("abc"), json!(1));
        store.settle().await;

        assert_eq!(backend.keys(), vec!["test:session:abc".to_string()]);
        let stored = SessionRecord::from_json(&backend.peek("test:session:abc").unwrap()).unwrap();
        assert_eq!(stored.payload, json!(1));
        assert_eq!(stored.ttl_seconds, 3600);
    }

    #[tokio::test]
    async fn test_write_marks_local_copy_synced() {
        let backend = MemoryBackend::new();
        let store = SessionStore::with_dialer(shared_config(), Arc::new(backend)).unwrap();

        store.write(&token("abc"), json!(1));
        assert!(store.inner.local.get(&token("abc")).is_some_and(|e| !e.synced));
        store.settle().await;
        assert!(store.inner.local.get(&token("abc")).is_some_and(|e| e.synced));
        assert_eq!(store.mode(), StoreMode::Shared);
    }

    #[tokio::test]
    async fn test_malformed_shared_record_falls_back() {
        let backend = MemoryBackend::new();
        backend.inject("test:session:abc", "not a record", Duration::from_secs(60));
        let store = SessionStore::with_dialer(shared_config(), Arc::new(backend)).unwrap();

        let mut modes = store.subscribe_mode();
        assert_eq!(store.load(&token("abc")).await, ReadOutcome::Unavailable);
        assert_eq!(store.load(&token("abc")).await, ReadOutcome::Unavailable);

        // The connection is fine; one bad record is not an outage.
        assert_eq!(*modes.borrow_and_update(), StoreMode::Shared);
        assert!(store.client().unwrap().is_connected());
        assert!(!modes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_session_id_is_stable() {
        let backend = MemoryBackend::new();
        let store = SessionStore::with_dialer(shared_config(), Arc::new(backend.clone())).unwrap();

        let first = store.resolve_session_id("ctx-1").await;
        let second = store.resolve_session_id("ctx-1").await;
        assert_eq!(first, second);
        assert_ne!(first, store.resolve_session_id("ctx-2").await);
        assert_eq!(
            backend.peek("test:session_id:ctx-1").as_deref(),
            Some(first.as_str())
        );
    }

    #[tokio::test]
    async fn test_resolve_session_id_unavailable_still_answers() {
        let backend = MemoryBackend::new();
        backend.set_reachable(false);
        let store = SessionStore::with_dialer(shared_config(), Arc::new(backend.clone())).unwrap();

        let first = store.resolve_session_id("ctx").await;
        let second = store.resolve_session_id("ctx").await;
        assert_ne!(first, second);
        assert!(backend.keys().is_empty());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(StoreMode::LocalOnly.to_string(), "local_only");
        assert_eq!(StoreMode::Degraded.as_str(), "degraded");
    }
}
