/*!
 * Central transport seam.
 *
 * A [`CentralTransport`] is the radio stack seen from the central role. Its
 * commands only start work and return immediately; outcomes arrive later as
 * [`TransportEvent`]s on the channel handed to the transport at creation.
 * Events for one peripheral are causally ordered, events for different
 * peripherals may interleave.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use bluelink_core::types::{DeviceId, GattUuid};

/// Error type for transport commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No usable radio (powered off, missing adapter, torn down)
    #[error("Transport unavailable")]
    Unavailable,

    /// The transport has never seen the referenced peripheral
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(DeviceId),

    /// The command was rejected
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Error reported by the platform radio stack
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Result type for transport commands
pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a link went down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The central asked for the disconnect
    LocalRequest,
    /// The peripheral closed the link
    RemoteRequest,
    /// Supervision timeout or other link loss
    LinkLoss,
    /// Platform-specific reason
    Other(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalRequest => write!(f, "local request"),
            DisconnectReason::RemoteRequest => write!(f, "remote request"),
            DisconnectReason::LinkLoss => write!(f, "link loss"),
            DisconnectReason::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Outcome of a GATT discovery request; the error carries the platform message
pub type DiscoveryOutcome = std::result::Result<Vec<GattUuid>, String>;

/// Asynchronous event emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An advertisement was received
    DeviceDiscovered {
        /// Peripheral identity
        id: DeviceId,
        /// Advertised local name, empty when absent
        name: String,
        /// Received signal strength in dBm
        rssi: f64,
    },
    /// A connection attempt succeeded
    Connected {
        /// Peripheral identity
        id: DeviceId,
    },
    /// A connection attempt failed before the link came up
    ConnectFailed {
        /// Peripheral identity
        id: DeviceId,
        /// Platform message
        reason: String,
    },
    /// An active or pending link went down
    Disconnected {
        /// Peripheral identity
        id: DeviceId,
        /// Why the link went down
        reason: DisconnectReason,
    },
    /// Response to [`CentralTransport::discover_services`]
    ServicesDiscovered {
        /// Peripheral identity
        id: DeviceId,
        /// Discovered service UUIDs or the failure
        services: DiscoveryOutcome,
    },
    /// Response to [`CentralTransport::discover_characteristics`]
    CharacteristicsDiscovered {
        /// Peripheral identity
        id: DeviceId,
        /// Service the characteristics belong to
        service: GattUuid,
        /// Discovered characteristic UUIDs or the failure
        characteristics: DiscoveryOutcome,
    },
    /// A scan that was accepted could not be started or was aborted by the radio
    ScanFailed {
        /// Platform message
        reason: String,
    },
}

impl TransportEvent {
    /// The peripheral this event concerns, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            TransportEvent::DeviceDiscovered { id, .. }
            | TransportEvent::Connected { id }
            | TransportEvent::ConnectFailed { id, .. }
            | TransportEvent::Disconnected { id, .. }
            | TransportEvent::ServicesDiscovered { id, .. }
            | TransportEvent::CharacteristicsDiscovered { id, .. } => Some(id),
            TransportEvent::ScanFailed { .. } => None,
        }
    }

    /// Short name of the event kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::DeviceDiscovered { .. } => "device_discovered",
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::ConnectFailed { .. } => "connect_failed",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::ServicesDiscovered { .. } => "services_discovered",
            TransportEvent::CharacteristicsDiscovered { .. } => "characteristics_discovered",
            TransportEvent::ScanFailed { .. } => "scan_failed",
        }
    }
}

/// Sending half of the transport event channel
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half of the transport event channel
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the single callback channel a transport delivers its events on
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Central-role radio capability
///
/// Implementations must not block: every command either fails immediately
/// or is acknowledged and completed later through the event channel.
pub trait CentralTransport: Send + fmt::Debug {
    /// Whether the radio can currently accept commands
    fn is_available(&self) -> bool {
        true
    }

    /// Begin discovery; an empty filter list means unrestricted
    fn start_scan(&mut self, service_filters: &[GattUuid]) -> Result<()>;

    /// Halt discovery
    fn stop_scan(&mut self) -> Result<()>;

    /// Start a connection attempt to a discovered peripheral
    fn connect(&mut self, device: &DeviceId) -> Result<()>;

    /// Tear down an active or pending connection
    fn disconnect(&mut self, device: &DeviceId) -> Result<()>;

    /// Request the services of a connected peripheral; empty filter means all
    fn discover_services(&mut self, device: &DeviceId, service_filters: &[GattUuid]) -> Result<()>;

    /// Request the characteristics of one service; empty filter means all
    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &GattUuid,
        characteristic_filters: &[GattUuid],
    ) -> Result<()>;
}

impl<T: CentralTransport + ?Sized> CentralTransport for Box<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn start_scan(&mut self, service_filters: &[GattUuid]) -> Result<()> {
        (**self).start_scan(service_filters)
    }

    fn stop_scan(&mut self) -> Result<()> {
        (**self).stop_scan()
    }

    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        (**self).connect(device)
    }

    fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        (**self).disconnect(device)
    }

    fn discover_services(&mut self, device: &DeviceId, service_filters: &[GattUuid]) -> Result<()> {
        (**self).discover_services(device, service_filters)
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceId,
        service: &GattUuid,
        characteristic_filters: &[GattUuid],
    ) -> Result<()> {
        (**self).discover_characteristics(device, service, characteristic_filters)
    }
}
