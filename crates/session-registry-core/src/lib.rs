//! Core abstractions for the distributed session registry.
//!
//! This crate provides the shared vocabulary:
//! - `RegistryConfig` - Configuration snapshot and endpoint parsing
//! - `SessionToken` - Validated, URL-safe session identifiers
//! - `SessionRecord` - The envelope stored in the shared backend
//! - `Outcome` - Explicit success/unavailable result for backend calls
//! - Backend and host-facing traits

pub mod config;
pub mod record;
pub mod token;
pub mod traits;

pub use config::{ConfigError, MAX_TTL_SECONDS, RegistryConfig, StoreEndpoint};
pub use record::SessionRecord;
pub use token::{SessionToken, TokenError, create_token};
pub use traits::{Dialer, KvConnection, Outcome, SessionMap, StoreError};
