/*!
 * BlueLink Core
 *
 * This crate provides the shared foundation for the BlueLink BLE central:
 * peripheral identity and GATT UUID types, configuration, logging and errors.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tracing;
    pub use uuid;
}

/// BlueLink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("BlueLink Core {} initialized", VERSION);
    Ok(())
}
