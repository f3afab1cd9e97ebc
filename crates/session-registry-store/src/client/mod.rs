//! Backing store client.
//!
//! Thin, soft-failing client over a `Dialer`. Connection set-up is lazy and
//! single-flight; after a failure no dial is attempted again until the
//! cool-down has elapsed. Commands take turns on the one connection. Each
//! round trip is bounded by the operation timeout from the moment its turn
//! starts, and any error or timeout drops the connection so a half-read
//! reply is never reused. Waiting for a turn is bounded separately and
//! never drops the connection.

pub mod resp;

use std::{
    future::Future,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use session_registry_core::{Dialer, KvConnection, Outcome, StoreEndpoint, StoreError};
use tokio::{sync::Mutex, time::Instant};

pub use resp::{RespConnection, TcpDialer};

/// A caller waits at most this many operation timeouts for its turn.
const MAX_QUEUED_TURNS: u32 = 8;

#[derive(Clone)]
enum Link {
    Idle,
    Up {
        conn: Arc<dyn KvConnection>,
        generation: u64,
    },
    Down {
        since: Instant,
    },
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on dialing and on every operation.
    pub op_timeout: Duration,
    /// Minimum delay between dial attempts after a failure.
    pub retry_cooldown: Duration,
    /// Trace every operation.
    pub debug: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(250),
            retry_cooldown: Duration::from_secs(5),
            debug: false,
        }
    }
}

/// Soft-failing client to the shared key-value store.
pub struct BackingClient {
    endpoint: StoreEndpoint,
    dialer: Arc<dyn Dialer>,
    options: ClientOptions,
    link: RwLock<Link>,
    dial_lock: Mutex<()>,
    turn: Mutex<()>,
    dial_attempts: AtomicU64,
    generations: AtomicU64,
}

impl BackingClient {
    /// Create a client. Nothing is dialed until first use.
    #[must_use]
    pub fn new(endpoint: StoreEndpoint, dialer: Arc<dyn Dialer>, options: ClientOptions) -> Self {
        Self {
            endpoint,
            dialer,
            options,
            link: RwLock::new(Link::Idle),
            dial_lock: Mutex::new(()),
            turn: Mutex::new(()),
            dial_attempts: AtomicU64::new(0),
            generations: AtomicU64::new(0),
        }
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &StoreEndpoint {
        &self.endpoint
    }

    /// Number of dial attempts made so far.
    #[must_use]
    pub fn dial_attempts(&self) -> u64 {
        self.dial_attempts.load(Ordering::SeqCst)
    }

    /// Whether a live connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.snapshot(), Link::Up { .. })
    }

    fn snapshot(&self) -> Link {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_link(&self, link: Link) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = link;
    }

    fn cooling_down(&self, since: Instant) -> bool {
        since.elapsed() < self.options.retry_cooldown
    }

    /// Establish the connection if needed.
    ///
    /// Concurrent callers share a single dial attempt and all observe its
    /// outcome. Within the cool-down after a failure this reports
    /// `Unavailable` without dialing.
    pub async fn connect(&self) -> Outcome<()> {
        match self.snapshot() {
            Link::Up { .. } => return Outcome::Success(()),
            Link::Down { since } if self.cooling_down(since) => return Outcome::Unavailable,
            _ => {}
        }

        let _guard = self.dial_lock.lock().await;

        // Another caller may have finished dialing while we waited.
        match self.snapshot() {
            Link::Up { .. } => return Outcome::Success(()),
            Link::Down { since } if self.cooling_down(since) => return Outcome::Unavailable,
            _ => {}
        }

        self.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let result =
            tokio::time::timeout(self.options.op_timeout, self.dialer.dial(&self.endpoint)).await;

        match result {
            Ok(Ok(conn)) => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                self.set_link(Link::Up { conn, generation });
                tracing::debug!(endpoint = %self.endpoint, generation, "Shared store connection established");
                Outcome::Success(())
            }
            Ok(Err(e)) => {
                self.set_link(Link::Down {
                    since: Instant::now(),
                });
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Failed to connect to shared store");
                Outcome::Unavailable
            }
            Err(_) => {
                self.set_link(Link::Down {
                    since: Instant::now(),
                });
                tracing::warn!(
                    endpoint = %self.endpoint,
                    timeout = ?self.options.op_timeout,
                    "Timed out connecting to shared store"
                );
                Outcome::Unavailable
            }
        }
    }

    /// Drop the connection identified by `generation`, if still current.
    fn invalidate(&self, generation: u64, error: &StoreError) {
        let mut link = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*link, Link::Up { generation: g, .. } if *g == generation) {
            *link = Link::Down {
                since: Instant::now(),
            };
            tracing::warn!(endpoint = %self.endpoint, %error, "Shared store connection dropped");
        }
    }

    /// Forget the current connection. The next call dials again.
    pub fn disconnect(&self) {
        self.set_link(Link::Idle);
    }

    async fn run<T, F, Fut>(&self, op: &'static str, key: &str, call: F) -> Outcome<T>
    where
        F: FnOnce(Arc<dyn KvConnection>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let queue_bound = self.options.op_timeout.saturating_mul(MAX_QUEUED_TURNS);
        let Ok(_turn) = tokio::time::timeout(queue_bound, self.turn.lock()).await else {
            tracing::debug!(op, key, waited = ?queue_bound, "Shared store busy; call not issued");
            return Outcome::Unavailable;
        };

        if !self.connect().await.is_success() {
            return Outcome::Unavailable;
        }
        let Link::Up { conn, generation } = self.snapshot() else {
            return Outcome::Unavailable;
        };

        let started = Instant::now();
        match tokio::time::timeout(self.options.op_timeout, call(conn)).await {
            Ok(Ok(value)) => {
                if self.options.debug {
                    tracing::debug!(op, key, elapsed = ?started.elapsed(), "Shared store call");
                }
                Outcome::Success(value)
            }
            Ok(Err(e)) => {
                self.invalidate(generation, &e);
                Outcome::Unavailable
            }
            Err(_) => {
                self.invalidate(generation, &StoreError::Timeout(self.options.op_timeout));
                Outcome::Unavailable
            }
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> bool {
        self.run("PING", "", |conn| async move { conn.ping().await })
            .await
            .is_success()
    }

    /// Read a value. `Success(None)` means the key is absent or expired.
    pub async fn get(&self, key: &str) -> Outcome<Option<String>> {
        self.run("GET", key, |conn| async move { conn.get(key).await })
            .await
    }

    /// Write a value with a lifetime in seconds.
    pub async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Outcome<()> {
        self.run("SETEX", key, |conn| async move {
            conn.set_ex(key, ttl_seconds, value).await
        })
        .await
    }

    /// Delete a key, best-effort.
    pub async fn delete(&self, key: &str) -> Outcome<bool> {
        self.run("DEL", key, |conn| async move { conn.del(key).await })
            .await
    }

    /// Test a key for existence.
    pub async fn exists(&self, key: &str) -> Outcome<bool> {
        self.run("EXISTS", key, |conn| async move { conn.exists(key).await })
            .await
    }
}
