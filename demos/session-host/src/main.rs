//! A toy request-serving host backed by the session registry.
//!
//! Run with: cargo run -p session-host-demo
//!
//! Set `SESSION_REGISTRY_URL=redis://127.0.0.1:6379` to share sessions
//! between several running copies; without it sessions stay in-process.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Value, json};
use session_registry_bridge::{SessionHost, SessionSlot, install};
use session_registry_core::{RegistryConfig, SessionToken};
use session_registry_store::SessionStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Host with its own session slot, unaware of where sessions live.
struct CounterApp {
    sessions: SessionSlot,
}

impl CounterApp {
    /// Handle one request: bump the visit counter for the caller's session.
    fn handle(&self, token: &SessionToken) -> u64 {
        let visits = self
            .sessions
            .read(token)
            .and_then(|session| session.get("visits").and_then(Value::as_u64))
            .unwrap_or(0)
            + 1;
        self.sessions.write(token, json!({ "visits": visits }));
        visits
    }
}

impl SessionHost for CounterApp {
    fn session_slot(&mut self) -> &mut SessionSlot {
        &mut self.sessions
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RegistryConfig::from_env();
    let default_filter = if config.debug_enabled { "debug" } else { "info" };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let store = SessionStore::new(config).context("invalid session registry configuration")?;
    if store.initialize().await {
        tracing::info!(mode = %store.mode(), "Shared store reachable");
    } else {
        tracing::warn!(mode = %store.mode(), "Serving sessions from this instance only");
    }

    let mut app = CounterApp {
        sessions: SessionSlot::new(),
    };
    let installed = install(&mut app, &store)?;
    tracing::info!(?installed, registry = %store.id(), "Host ready");

    let app = Arc::new(app);
    let visitors: Vec<SessionToken> = (0..3).map(|_| store.create_token()).collect();

    // A few rounds of concurrent requests, one per visitor.
    for round in 1..=3 {
        let requests = visitors.iter().cloned().map(|token| {
            let app = Arc::clone(&app);
            tokio::spawn(async move { (app.handle(&token), token) })
        });
        for result in futures::future::join_all(requests).await {
            let (visits, token) = result?;
            tracing::info!(round, %token, visits, "Request served");
        }
    }

    let stable = store.resolve_session_id("demo-worker").await;
    tracing::info!(%stable, "Resolved worker session id");

    for token in &visitors {
        app.sessions.remove(token);
    }
    store.shutdown().await;
    tracing::info!(remaining = store.local_tokens().len(), "Shut down");
    Ok(())
}
