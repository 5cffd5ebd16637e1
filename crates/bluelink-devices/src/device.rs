/*!
 * Discovered peripheral model.
 *
 * A [`Device`] is the value handed to observers for every peripheral seen
 * during a scan session. It carries the transport-assigned identity, the
 * advertised name and the latest received signal strength, from which a
 * rough distance is derived on demand.
 */
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use bluelink_core::types::DeviceId;

/// Name shown for peripherals that do not advertise one
pub const UNKNOWN_NAME: &str = "Unknown";

/// RSSI magnitude (dB) at which the estimate equals the scale factor
const REFERENCE_RSSI: f64 = 50.0;
/// Decibels per tenfold change in estimated distance
const PATH_LOSS_SPAN: f64 = 50.0;
/// Distance in metres at the reference RSSI
const DISTANCE_SCALE: f64 = 0.7;

/// Weakest RSSI (dBm) for which the estimate is still below `f64::MAX`
///
/// Radios report RSSI as a signed byte, so real readings sit far inside
/// this bound.
pub const SATURATION_RSSI: f64 = -15_000.0;

/// Estimate the distance to a transmitter in metres from its RSSI
///
/// Strictly decreasing in signal strength over `SATURATION_RSSI <= rssi <= 0`
/// and strictly positive for every finite input. Weaker readings saturate at
/// `f64::MAX`.
pub fn distance_from_rssi(rssi: f64) -> f64 {
    let exponent = (rssi.abs() - REFERENCE_RSSI) / PATH_LOSS_SPAN;
    (DISTANCE_SCALE * 10f64.powf(exponent)).min(f64::MAX)
}

/// Coarse proximity bucket derived from the distance estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proximity {
    /// Within half a metre
    Immediate,
    /// Within three metres
    Near,
    /// Anything further
    Far,
}

impl Proximity {
    /// Classify a distance estimate in metres
    pub fn from_distance(distance: f64) -> Self {
        if distance < 0.5 {
            Proximity::Immediate
        } else if distance < 3.0 {
            Proximity::Near
        } else {
            Proximity::Far
        }
    }
}

/// A peripheral seen during discovery
///
/// Two devices are equal when their identities are equal, whatever their
/// names or signal strengths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    id: DeviceId,
    name: String,
    rssi: f64,
}

impl Device {
    /// Create a device from a discovery event
    pub fn new<S: Into<String>>(id: DeviceId, name: S, rssi: f64) -> Self {
        Self {
            id,
            name: name.into(),
            rssi,
        }
    }

    /// Transport-assigned identity
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Advertised name, possibly empty
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Advertised name, or [`UNKNOWN_NAME`] when none was advertised
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            UNKNOWN_NAME
        } else {
            &self.name
        }
    }

    /// Latest RSSI in dBm
    pub fn signal_strength(&self) -> f64 {
        self.rssi
    }

    /// Estimated distance in metres, recomputed from the current RSSI
    pub fn distance_estimate(&self) -> f64 {
        distance_from_rssi(self.rssi)
    }

    /// Proximity bucket for the current RSSI
    pub fn proximity(&self) -> Proximity {
        Proximity::from_distance(self.distance_estimate())
    }

    pub(crate) fn set_signal_strength(&mut self, rssi: f64) {
        self.rssi = rssi;
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {} dBm)", self.display_name(), self.id, self.rssi)
    }
}
