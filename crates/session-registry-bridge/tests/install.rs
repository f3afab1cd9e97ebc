//! Installing a registry into a host application.

use std::sync::Arc;

use serde_json::{Value, json};
use session_registry_bridge::{BridgeError, Installed, SessionHost, SessionSlot, install};
use session_registry_core::{RegistryConfig, SessionToken};
use session_registry_store::{MemoryBackend, SessionStore};

/// Minimal host: stores a session per login and reads it back per request.
struct LoginHost {
    sessions: SessionSlot,
}

impl LoginHost {
    fn new() -> Self {
        Self {
            sessions: SessionSlot::new(),
        }
    }

    fn login(&self, token: &SessionToken, user: &str) {
        self.sessions.write(token, json!({"user": user}));
    }

    fn current_user(&self, token: &SessionToken) -> Option<Value> {
        if !self.sessions.contains(token) {
            return None;
        }
        self.sessions.read(token)?.get("user").cloned()
    }

    fn logout(&self, token: &SessionToken) {
        self.sessions.remove(token);
    }
}

impl SessionHost for LoginHost {
    fn session_slot(&mut self) -> &mut SessionSlot {
        &mut self.sessions
    }
}

fn shared_store(backend: &MemoryBackend) -> SessionStore {
    SessionStore::with_dialer(
        RegistryConfig {
            store_endpoint: Some("redis://sessions.internal:6379".to_string()),
            ..RegistryConfig::default()
        },
        Arc::new(backend.clone()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_install_twice_is_idempotent() {
    let store = SessionStore::new(RegistryConfig::default()).unwrap();
    let mut host = LoginHost::new();

    assert_eq!(install(&mut host, &store).unwrap(), Installed::Fresh);
    assert_eq!(install(&mut host, &store).unwrap(), Installed::AlreadyPresent);
    assert_eq!(host.sessions.registry_id(), Some(store.id()));

    // One layer: writes through the host land directly in the registry.
    let token = store.create_token();
    host.login(&token, "ada");
    assert_eq!(store.read(&token), Some(json!({"user": "ada"})));
    assert_eq!(host.sessions.storage().registry_id(), Some(store.id()));
}

#[tokio::test]
async fn test_install_after_use_is_rejected() {
    let store = SessionStore::new(RegistryConfig::default()).unwrap();
    let mut host = LoginHost::new();
    let token = store.create_token();
    host.login(&token, "ada");

    let err = install(&mut host, &store).unwrap_err();
    assert!(matches!(err, BridgeError::HostAlreadyServing));
    assert_eq!(host.sessions.registry_id(), None);
    assert_eq!(host.current_user(&token), Some(json!("ada")));
}

#[tokio::test]
async fn test_second_registry_replaces_first() {
    let first = SessionStore::new(RegistryConfig::default()).unwrap();
    let second = SessionStore::new(RegistryConfig::default()).unwrap();
    let mut host = LoginHost::new();

    assert_eq!(install(&mut host, &first).unwrap(), Installed::Fresh);
    assert_eq!(install(&mut host, &second).unwrap(), Installed::Fresh);
    assert_eq!(host.sessions.registry_id(), Some(second.id()));

    let token = second.create_token();
    host.login(&token, "grace");
    assert!(second.contains(&token));
    assert!(!first.contains(&token));
}

#[tokio::test]
async fn test_host_call_sites_unchanged_over_shared_store() {
    let backend = MemoryBackend::new();
    let store = shared_store(&backend);
    let mut host = LoginHost::new();
    install(&mut host, &store).unwrap();

    let token = store.create_token();
    host.login(&token, "ada");
    assert_eq!(host.current_user(&token), Some(json!("ada")));
    store.settle().await;
    assert_eq!(backend.keys().len(), 1);

    host.logout(&token);
    assert_eq!(host.current_user(&token), None);
    store.settle().await;
    assert!(backend.keys().is_empty());
}

#[tokio::test]
async fn test_constructor_injection() {
    let backend = MemoryBackend::new();
    let store = shared_store(&backend);
    let mut host = LoginHost {
        sessions: SessionSlot::with_storage(Arc::new(store.clone())),
    };
    assert_eq!(install(&mut host, &store).unwrap(), Installed::AlreadyPresent);

    let token = store.create_token();
    host.login(&token, "linus");

    // Another host instance sharing the backend sees the session.
    let other_store = shared_store(&backend);
    let other = LoginHost {
        sessions: SessionSlot::with_storage(Arc::new(other_store.clone())),
    };
    store.settle().await;
    assert!(other_store.load(&token).await.payload().is_some());
    assert_eq!(other.current_user(&token), Some(json!("linus")));
}
