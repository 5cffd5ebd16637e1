/*!
 * Observer events published by the connection controller.
 */
use bluelink_devices::{Device, DisconnectReason};

use crate::error::ControllerError;
use crate::profile::ResolvedProfile;

/// Capacity of the observer broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Terminal outcome of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    /// The handshake finished; the profile lists every requested service
    Connected(ResolvedProfile),
    /// The attempt ended without a usable connection
    Failed(ControllerError),
}

impl ConnectionOutcome {
    /// Whether the attempt produced a connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionOutcome::Connected(_))
    }
}

/// Notification delivered to controller observers
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// The set of discovered devices changed; carries the full ordered list
    AvailableDevicesChanged(Vec<Device>),
    /// A connection attempt finished, exactly once per attempt
    ConnectionResult {
        /// The connection target
        device: Device,
        /// How the attempt ended
        outcome: ConnectionOutcome,
    },
    /// An established connection ended
    Disconnected {
        /// The formerly connected device
        device: Device,
        /// Why the link went down
        reason: DisconnectReason,
    },
    /// A running scan was aborted by the radio; discovery is stopped
    DiscoveryFailed(ControllerError),
}

impl ControllerEvent {
    /// Short name of the event kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::AvailableDevicesChanged(_) => "available_devices_changed",
            ControllerEvent::ConnectionResult { .. } => "connection_result",
            ControllerEvent::Disconnected { .. } => "disconnected",
            ControllerEvent::DiscoveryFailed(_) => "discovery_failed",
        }
    }
}
