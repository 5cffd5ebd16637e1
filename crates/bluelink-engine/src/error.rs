/*!
 * Error types for the BlueLink engine crate.
 */
use thiserror::Error;

use bluelink_core::types::{DeviceId, GattUuid};
use bluelink_devices::TransportError;

/// Error type for connection controller operations
///
/// Cloneable so that a failure can be delivered both to the caller and to
/// every observer of the attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Scan or connect requested with no usable transport
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// The operation references an identity that was not discovered
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// The transport reported a failure or the link dropped during the handshake
    #[error("Connection to {device} failed: {reason}")]
    ConnectionFailed {
        /// The connection target
        device: DeviceId,
        /// What went wrong
        reason: String,
    },

    /// A required service or characteristic is absent or undiscoverable
    #[error("Service {service} on {device} could not be resolved: {reason}")]
    ServiceResolutionFailed {
        /// The connection target
        device: DeviceId,
        /// The service that failed, or the first requested one if discovery failed wholesale
        service: GattUuid,
        /// What went wrong
        reason: String,
    },

    /// A connection attempt is already pending or established
    #[error("Operation already in progress with {target}")]
    OperationAlreadyInProgress {
        /// Target of the existing session
        target: DeviceId,
    },

    /// The controller task has shut down
    #[error("Controller service stopped")]
    ServiceStopped,
}

/// Result type for connection controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Create a new connection failure
    pub fn connection_failed<S: AsRef<str>>(device: &DeviceId, reason: S) -> Self {
        ControllerError::ConnectionFailed {
            device: device.clone(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new service resolution failure
    pub fn service_resolution_failed<S: AsRef<str>>(
        device: &DeviceId,
        service: GattUuid,
        reason: S,
    ) -> Self {
        ControllerError::ServiceResolutionFailed {
            device: device.clone(),
            service,
            reason: reason.as_ref().to_string(),
        }
    }

    /// Translate a transport command failure that concerns `device`
    pub fn from_transport(device: &DeviceId, err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => ControllerError::TransportUnavailable,
            TransportError::UnknownPeripheral(id) => ControllerError::UnknownDevice(id),
            other => ControllerError::connection_failed(device, other.to_string()),
        }
    }
}
