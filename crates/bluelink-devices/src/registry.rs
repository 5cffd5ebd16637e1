/*!
 * Discovery registry for BlueLink.
 *
 * Accumulates the peripherals seen during one scan session, keyed by
 * identity and kept in first-discovery order.
 */
use std::collections::HashMap;

use tracing::{debug, trace};

use bluelink_core::types::DeviceId;

use crate::device::Device;

/// Raw advertisement data as delivered by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEvent {
    /// Peripheral identity
    pub id: DeviceId,
    /// Advertised name, empty when absent
    pub name: String,
    /// Received signal strength in dBm
    pub rssi: f64,
}

impl DiscoveryEvent {
    /// Create a new discovery event
    pub fn new<I: Into<DeviceId>, S: Into<String>>(id: I, name: S, rssi: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
        }
    }
}

/// What [`DiscoveryRegistry::register`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First sighting of this identity; the visible set changed
    Added,
    /// Known identity; only the signal strength was refreshed
    Refreshed,
}

impl Registration {
    /// Whether the set of identities visible to observers changed
    pub fn is_visible_change(self) -> bool {
        matches!(self, Registration::Added)
    }
}

/// Deduplicating, order-preserving store of discovered devices
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    /// Devices in first-discovery order
    devices: Vec<Device>,
    /// Position of each identity in `devices`
    index: HashMap<DeviceId, usize>,
}

impl DiscoveryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new device or refresh the signal strength of a known one
    pub fn register(&mut self, event: DiscoveryEvent) -> Registration {
        if let Some(&position) = self.index.get(&event.id) {
            trace!(device = %event.id, rssi = event.rssi, "Refreshed signal strength");
            self.devices[position].set_signal_strength(event.rssi);
            return Registration::Refreshed;
        }

        debug!(device = %event.id, name = %event.name, rssi = event.rssi, "Discovered device");
        self.index.insert(event.id.clone(), self.devices.len());
        self.devices.push(Device::new(event.id, event.name, event.rssi));
        Registration::Added
    }

    /// The current devices in first-discovery order
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.clone()
    }

    /// Forget every device
    pub fn reset(&mut self) {
        if !self.devices.is_empty() {
            debug!("Cleared {} discovered devices", self.devices.len());
        }
        self.devices.clear();
        self.index.clear();
    }

    /// Look up a device by identity
    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.index.get(id).map(|&position| &self.devices[position])
    }

    /// Check if a device has been discovered
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.index.contains_key(id)
    }

    /// Count discovered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if nothing has been discovered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
