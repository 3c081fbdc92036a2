//! portrelay-core: shared types for the port relay.
//!
//! Provides the validated port mapping table, backend addresses, relay
//! settings, and the error type used across the workspace.

pub mod error;
pub mod mapping;
pub mod settings;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use mapping::{BackendAddr, MappingEntry, MappingTable};
pub use settings::{secs_or_disabled, RelaySettings};
