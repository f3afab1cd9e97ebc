//! Shared-store session registry with local fallback.
//!
//! Provides:
//! - `SessionStore` - Host-facing registry (synchronous map over an async store)
//! - `BackingClient` - Soft-failing client to the shared key-value store
//! - Storage implementations (local fallback, in-process shared backend)

pub mod client;
pub mod storage;
pub mod store;

pub use client::{BackingClient, ClientOptions, TcpDialer};
pub use storage::{LocalStore, MemoryBackend};
pub use store::{ReadOutcome, SessionStore, Source, StoreMode};
