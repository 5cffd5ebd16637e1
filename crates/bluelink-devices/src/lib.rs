/*!
 * BlueLink Devices
 *
 * This crate provides the discovered-peripheral model, the discovery
 * registry and the central transport seam, with an in-memory transport for
 * tests and an optional `btleplug` transport for real radios.
 */

#![warn(missing_docs)]

// Re-export core types
pub use bluelink_core::prelude;

pub mod device;
pub mod registry;
pub mod simulated;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btle;

// Re-export the model and transport seam for convenience
pub use device::{distance_from_rssi, Device, Proximity};
pub use registry::{DiscoveryEvent, DiscoveryRegistry, Registration};
pub use simulated::{SimulatedCentral, SimulatedPeripheral, TransportCommand};
pub use transport::{
    event_channel, CentralTransport, DisconnectReason, EventReceiver, EventSender, TransportError,
    TransportEvent,
};

#[cfg(feature = "btleplug")]
pub use btle::BtleplugCentral;

/// BlueLink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["simulated"];

    #[cfg(feature = "btleplug")]
    transports.push("btleplug");

    transports
}
