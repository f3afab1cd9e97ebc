//! Storage implementations.

pub mod local;
pub mod memory;

pub use local::{LocalEntry, LocalStore, Pending};
pub use memory::MemoryBackend;
