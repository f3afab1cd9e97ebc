//! Post-construction installation of a registry into a host.

use std::sync::Arc;

use session_registry_store::SessionStore;
use thiserror::Error;
use tracing::{debug, info};

use crate::slot::SessionSlot;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Host has already served sessions; install the registry before first use")]
    HostAlreadyServing,
}

/// Result of a successful `install`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// The registry now backs the host's slot.
    Fresh,
    /// The same registry was already installed. Nothing changed.
    AlreadyPresent,
}

/// A host application that keeps sessions in a `SessionSlot`.
pub trait SessionHost {
    fn session_slot(&mut self) -> &mut SessionSlot;
}

/// Install `store` as the host's session storage.
///
/// Installing the same registry again is a no-op. Installing a different
/// registry replaces the current storage outright; the slot never holds
/// a registry wrapped around another.
///
/// # Errors
///
/// Returns `BridgeError::HostAlreadyServing` if the host has already read or
/// written sessions through its slot, since entries held by the previous
/// storage would silently disappear.
pub fn install<H: SessionHost + ?Sized>(
    host: &mut H,
    store: &SessionStore,
) -> Result<Installed, BridgeError> {
    let slot = host.session_slot();

    if slot.registry_id() == Some(store.id()) {
        debug!(registry = %store.id(), "Session registry already installed");
        return Ok(Installed::AlreadyPresent);
    }
    if slot.is_serving() {
        return Err(BridgeError::HostAlreadyServing);
    }

    let previous = slot.replace(Arc::new(store.clone()));
    info!(
        registry = %store.id(),
        mode = %store.mode(),
        replaced = ?previous.registry_id(),
        "Session registry installed"
    );
    Ok(Installed::Fresh)
}
