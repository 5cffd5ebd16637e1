/*!
 * Prelude module for BlueLink Core.
 *
 * This module re-exports commonly used types and functions from the BlueLink Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DeviceId, GattUuid};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, RequiredService, SharedConfig};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
