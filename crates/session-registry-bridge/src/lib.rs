//! Host integration for the session registry.
//!
//! Provides:
//! - `SessionSlot` - The host-owned storage slot, injectable at construction
//! - `SessionHost` - Trait for hosts exposing their slot
//! - `install` - Idempotent post-construction installation of a registry

pub mod install;
pub mod slot;

pub use install::{BridgeError, Installed, SessionHost, install};
pub use slot::{InMemorySessions, SessionSlot};
