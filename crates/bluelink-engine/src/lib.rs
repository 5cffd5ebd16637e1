/*!
 * BlueLink Engine
 *
 * This crate provides the connection controller for the BlueLink central:
 * the scan and connect state machine, the GATT handshake that resolves a
 * peripheral's services, observer events and an async service that runs a
 * controller on its own task.
 */

#![warn(missing_docs)]

// Re-export core types
pub use bluelink_core::prelude;

pub mod controller;
pub mod error;
pub mod events;
pub mod profile;
pub mod service;

// Re-export main types for convenience
pub use controller::{ConnectionController, ControllerState};
pub use error::{ControllerError, Result};
pub use events::{ConnectionOutcome, ControllerEvent};
pub use profile::{ResolvedProfile, ResolvedService, ServiceResolution};
pub use service::{ControllerHandle, ControllerService};

/// BlueLink engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("BlueLink Engine {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
