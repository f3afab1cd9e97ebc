//! Host-owned session storage slot.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::Value;
use session_registry_core::{SessionMap, SessionToken};
use uuid::Uuid;

/// Plain in-process map. The storage a host uses when nothing is injected.
#[derive(Debug, Default)]
pub struct InMemorySessions {
    sessions: RwLock<HashMap<SessionToken, Value>>,
}

impl SessionMap for InMemorySessions {
    fn contains(&self, token: &SessionToken) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(token)
    }

    fn read(&self, token: &SessionToken) -> Option<Value> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    fn write(&self, token: &SessionToken, payload: Value) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), payload);
    }

    fn remove(&self, token: &SessionToken) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }
}

/// The mutable storage slot a host keeps its sessions in.
///
/// Hosts either inject storage at construction (`with_storage`) or start
/// with the in-memory default and have a registry installed before they
/// begin serving. The first mapping call latches the slot as serving.
pub struct SessionSlot {
    storage: Arc<dyn SessionMap>,
    serving: AtomicBool,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSlot")
            .field("registry_id", &self.storage.registry_id())
            .field("serving", &self.is_serving())
            .finish()
    }
}

impl SessionSlot {
    /// Slot backed by a plain in-memory map.
    #[must_use]
    pub fn new() -> Self {
        Self::with_storage(Arc::new(InMemorySessions::default()))
    }

    /// Slot backed by injected storage.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn SessionMap>) -> Self {
        Self {
            storage,
            serving: AtomicBool::new(false),
        }
    }

    /// Whether the host has used the slot yet.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Identity of the installed registry, if any.
    #[must_use]
    pub fn registry_id(&self) -> Option<Uuid> {
        self.storage.registry_id()
    }

    /// Current storage.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn SessionMap> {
        Arc::clone(&self.storage)
    }

    /// Swap the storage, returning the previous one.
    pub(crate) fn replace(&mut self, storage: Arc<dyn SessionMap>) -> Arc<dyn SessionMap> {
        std::mem::replace(&mut self.storage, storage)
    }

    fn serve(&self) -> &dyn SessionMap {
        self.serving.store(true, Ordering::SeqCst);
        self.storage.as_ref()
    }

    pub fn contains(&self, token: &SessionToken) -> bool {
        self.serve().contains(token)
    }

    pub fn read(&self, token: &SessionToken) -> Option<Value> {
        self.serve().read(token)
    }

    pub fn write(&self, token: &SessionToken, payload: Value) {
        self.serve().write(token, payload);
    }

    pub fn remove(&self, token: &SessionToken) {
        self.serve().remove(token);
    }
}
