//! Local fallback store.
//!
//! In-process session map used while the shared store is unreachable and as
//! the write-through cache in front of it. Visible to this instance only.
//! Expiry is lazy: an entry past its deadline is evicted when touched.
//!
//! While a shared store is in use, a removal leaves a hidden tombstone that
//! expires like an entry. It carries a version, so a shared record read
//! before the delete went out cannot be pulled back in.

use std::{
    collections::HashMap,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use session_registry_core::{SessionToken, config::MAX_TTL_SECONDS};
use tokio::time::Instant;

/// A local change the shared store has not confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// Write the payload with the remaining lifetime.
    Put {
        payload: Value,
        created_at: i64,
        ttl_seconds: u64,
        version: u64,
    },
    /// Delete the shared copy.
    Delete { version: u64 },
}

/// A locally held session.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// Host payload.
    pub payload: Value,
    /// Creation timestamp carried into the shared record (Unix seconds).
    pub created_at: i64,
    /// When this copy was stored or last refreshed.
    pub stored_at: Instant,
    /// Expiry deadline.
    pub expires_at: Instant,
    /// Bumped on every local change.
    pub version: u64,
    /// Whether the shared store is known to hold this version.
    pub synced: bool,
    /// Removed locally; hidden from reads.
    pub removed: bool,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn is_live(&self, now: Instant) -> bool {
        !self.removed && !self.is_expired(now)
    }

    /// Whole seconds left before expiry, rounded up.
    #[must_use]
    pub fn remaining_secs(&self, now: Instant) -> Option<u64> {
        let left = self.expires_at.checked_duration_since(now)?;
        if left.is_zero() {
            return None;
        }
        Some(left.as_secs() + u64::from(left.subsec_nanos() > 0))
    }
}

/// Single-instance session map with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: RwLock<HashMap<SessionToken, LocalEntry>>,
    versions: AtomicU64,
}

impl LocalStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionToken, LocalEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_entry(&self, payload: Value, created_at: i64, ttl: Duration, synced: bool) -> LocalEntry {
        let now = Instant::now();
        let ttl = ttl.min(Duration::from_secs(MAX_TTL_SECONDS));
        LocalEntry {
            payload,
            created_at,
            stored_at: now,
            expires_at: now + ttl,
            version: self.next_version(),
            synced,
            removed: false,
        }
    }

    fn entry(&self, token: &SessionToken) -> Option<LocalEntry> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Store a locally written payload. Returns the new version.
    pub fn insert(&self, token: SessionToken, payload: Value, created_at: i64, ttl: Duration) -> u64 {
        let entry = self.fresh_entry(payload, created_at, ttl, false);
        let version = entry.version;
        self.entries_mut().insert(token, entry);
        version
    }

    /// Fetch a live entry, evicting it if its deadline has passed.
    #[must_use]
    pub fn get(&self, token: &SessionToken) -> Option<LocalEntry> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(token) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => {
                    return Some(entry.clone()).filter(|e| !e.removed);
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries_mut();
        if entries.get(token).is_some_and(|e| e.is_expired(now)) {
            entries.remove(token);
        }
        None
    }

    /// Membership test honoring expiry.
    #[must_use]
    pub fn contains(&self, token: &SessionToken) -> bool {
        self.get(token).is_some()
    }

    /// Payload of an unexpired entry.
    #[must_use]
    pub fn read(&self, token: &SessionToken) -> Option<Value> {
        self.get(token).map(|e| e.payload)
    }

    /// Version of an unexpired entry, tombstones included.
    #[must_use]
    pub fn version_of(&self, token: &SessionToken) -> Option<u64> {
        self.entry(token).map(|e| e.version)
    }

    /// Remove an entry, returning it if it was live.
    pub fn remove(&self, token: &SessionToken) -> Option<LocalEntry> {
        let now = Instant::now();
        self.entries_mut()
            .remove(token)
            .filter(|e| e.is_live(now))
    }

    /// Remove an entry, keeping a tombstone for `ttl`. Returns the
    /// tombstone's version.
    pub fn tombstone(&self, token: SessionToken, ttl: Duration) -> u64 {
        let mut entry = self.fresh_entry(Value::Null, 0, ttl, false);
        entry.removed = true;
        let version = entry.version;
        self.entries_mut().insert(token, entry);
        version
    }

    /// Mark `version` as held by the shared store. No-op if the entry has
    /// changed since.
    pub fn mark_synced(&self, token: &SessionToken, version: u64) -> bool {
        match self.entries_mut().get_mut(token) {
            Some(entry) if entry.version == version => {
                entry.synced = true;
                true
            }
            _ => false,
        }
    }

    /// The latest change to `token` the shared store has not confirmed.
    #[must_use]
    pub fn pending(&self, token: &SessionToken) -> Option<Pending> {
        let now = Instant::now();
        let entry = self.entry(token).filter(|e| !e.synced)?;
        if entry.removed {
            return Some(Pending::Delete {
                version: entry.version,
            });
        }
        Some(Pending::Put {
            ttl_seconds: entry.remaining_secs(now)?,
            payload: entry.payload,
            created_at: entry.created_at,
            version: entry.version,
        })
    }

    /// Apply a value read from the shared store.
    ///
    /// `expected` is the version observed before the read was issued. The
    /// update is applied only if the local entry is unchanged since then and
    /// holds nothing the shared store has not seen (a pending tombstone
    /// counts); `None` as `incoming` evicts. Returns whether anything
    /// changed.
    pub fn reconcile(
        &self,
        token: &SessionToken,
        expected: Option<u64>,
        incoming: Option<(Value, i64, Duration)>,
    ) -> bool {
        let now = Instant::now();
        let mut entries = self.entries_mut();
        let current = entries.get(token).filter(|e| !e.is_expired(now));
        let current_version = current.map(|e| e.version);
        if current_version != expected || current.is_some_and(|e| !e.synced) {
            return false;
        }

        match incoming {
            Some((payload, created_at, ttl)) => {
                let entry = self.fresh_entry(payload, created_at, ttl, true);
                entries.insert(token.clone(), entry);
                true
            }
            None => entries.remove(token).is_some(),
        }
    }

    /// Tokens with changes the shared store has not confirmed, sorted.
    #[must_use]
    pub fn unsynced(&self) -> Vec<SessionToken> {
        let now = Instant::now();
        let mut tokens: Vec<SessionToken> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| !e.synced && !e.is_expired(now))
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Tokens of all live entries.
    #[must_use]
    pub fn tokens(&self) -> Vec<SessionToken> {
        let now = Instant::now();
        let mut tokens: Vec<SessionToken> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries_mut();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn token(raw: &str) -> SessionToken {
        SessionToken::parse(raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry() {
        let store = LocalStore::new();
        store.insert(token("abc"), json!({"x": 1}), 0, Duration::from_secs(2));

        assert_eq!(store.read(&token("abc")), Some(json!({"x": 1})));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.contains(&token("abc")));
        assert!(store.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_insert_overwrites_and_remove() {
        let store = LocalStore::new();
        let v1 = store.insert(token("k1"), json!("v1"), 0, Duration::from_secs(60));
        let v2 = store.insert(token("k1"), json!("v2"), 0, Duration::from_secs(60));
        assert!(v2 > v1);
        assert_eq!(store.read(&token("k1")), Some(json!("v2")));

        assert!(store.remove(&token("k1")).is_some());
        assert!(store.remove(&token("k1")).is_none());
        assert_eq!(store.read(&token("k1")), None);
    }

    #[tokio::test]
    async fn test_mark_synced_requires_same_version() {
        let store = LocalStore::new();
        let v1 = store.insert(token("k"), json!(1), 0, Duration::from_secs(60));
        let v2 = store.insert(token("k"), json!(2), 0, Duration::from_secs(60));

        assert!(!store.mark_synced(&token("k"), v1));
        assert_eq!(store.unsynced().len(), 1);
        assert!(store.mark_synced(&token("k"), v2));
        assert!(store.unsynced().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_never_clobbers_unsynced_writes() {
        let store = LocalStore::new();
        let version = store.insert(token("k"), json!("local"), 0, Duration::from_secs(60));

        let incoming = Some((json!("remote"), 0, Duration::from_secs(60)));
        assert!(!store.reconcile(&token("k"), Some(version), incoming.clone()));
        assert_eq!(store.read(&token("k")), Some(json!("local")));

        store.mark_synced(&token("k"), version);
        assert!(store.reconcile(&token("k"), Some(version), incoming));
        assert_eq!(store.read(&token("k")), Some(json!("remote")));
    }

    #[tokio::test]
    async fn test_reconcile_detects_concurrent_change() {
        let store = LocalStore::new();
        // Nothing local when the read was issued, then a local write lands.
        store.insert(token("k"), json!("new"), 0, Duration::from_secs(60));
        assert!(!store.reconcile(&token("k"), None, None));
        assert_eq!(store.read(&token("k")), Some(json!("new")));

        assert!(store.reconcile(
            &token("other"),
            None,
            Some((json!("adopted"), 0, Duration::from_secs(60)))
        ));
        assert!(store.get(&token("other")).unwrap().synced);
    }

    #[tokio::test]
    async fn test_tombstone_blocks_stale_shared_copy() {
        let store = LocalStore::new();
        let written = store.insert(token("k"), json!("v"), 0, Duration::from_secs(60));
        store.mark_synced(&token("k"), written);
        let stale = Some((json!("v"), 0, Duration::from_secs(60)));

        let removed = store.tombstone(token("k"), Duration::from_secs(60));
        assert!(!store.contains(&token("k")));
        assert!(store.tokens().is_empty());
        assert_eq!(store.version_of(&token("k")), Some(removed));
        assert_eq!(store.pending(&token("k")), Some(Pending::Delete { version: removed }));

        // Delete not confirmed yet: nothing from the shared store is adopted.
        assert!(!store.reconcile(&token("k"), Some(removed), stale.clone()));

        // A read issued before the removal does not match the tombstone.
        assert!(store.mark_synced(&token("k"), removed));
        assert_eq!(store.pending(&token("k")), None);
        assert!(!store.reconcile(&token("k"), None, stale));
        assert!(!store.contains(&token("k")));

        // A read issued after the delete went out is authoritative.
        assert!(store.reconcile(&token("k"), Some(removed), None));
        assert_eq!(store.version_of(&token("k")), None);
    }

    #[tokio::test]
    async fn test_pending_tracks_latest_change() {
        let store = LocalStore::new();
        assert_eq!(store.pending(&token("k")), None);

        store.insert(token("k"), json!("old"), 7, Duration::from_secs(60));
        let newest = store.insert(token("k"), json!("new"), 7, Duration::from_secs(60));
        assert_eq!(
            store.pending(&token("k")),
            Some(Pending::Put {
                payload: json!("new"),
                created_at: 7,
                ttl_seconds: 60,
                version: newest,
            })
        );

        store.mark_synced(&token("k"), newest);
        assert_eq!(store.pending(&token("k")), None);
        assert!(store.unsynced().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_clamped() {
        let store = LocalStore::new();
        store.insert(token("k"), json!(1), 0, Duration::MAX);
        assert!(store.contains(&token("k")));
        let entry = store.get(&token("k")).unwrap();
        assert!(entry.remaining_secs(Instant::now()).unwrap() <= MAX_TTL_SECONDS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_secs_rounds_up() {
        let store = LocalStore::new();
        store.insert(token("k"), json!(1), 0, Duration::from_millis(1_500));
        let entry = store.get(&token("k")).unwrap();
        assert_eq!(entry.remaining_secs(Instant::now()), Some(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
    }
}
