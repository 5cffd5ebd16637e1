/*!
 * Core data types for BlueLink.
 *
 * Peripheral identity as assigned by a transport, and GATT UUIDs in both
 * their 16-bit short and 128-bit forms.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, stable identifier assigned to a peripheral by a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from a transport-specific string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Create a fresh random identifier, for transports without native addresses
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

const SHORT_UUID_SHIFT: u32 = 96;

/// A GATT service or characteristic UUID
///
/// Parses and displays 16-bit short UUIDs (`"FFE1"`) relative to the
/// Bluetooth base UUID, and accepts any full 128-bit UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GattUuid(Uuid);

impl GattUuid {
    /// Expand a 16-bit assigned number onto the base UUID
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Expand a 32-bit assigned number onto the base UUID
    pub const fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(
            BLUETOOTH_BASE_UUID | ((short as u128) << SHORT_UUID_SHIFT),
        ))
    }

    /// Wrap a full 128-bit UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying 128-bit UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The 16-bit short form, if this UUID sits on the base UUID
    pub fn as_u16(&self) -> Option<u16> {
        let value = self.0.as_u128();
        let mask = 0xFFFF_u128 << SHORT_UUID_SHIFT;
        if value & !mask == BLUETOOTH_BASE_UUID {
            Some((value >> SHORT_UUID_SHIFT) as u16)
        } else {
            None
        }
    }
}

impl fmt::Display for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "{:04X}", short),
            None => write!(f, "{}", self.0.hyphenated()),
        }
    }
}

impl FromStr for GattUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        match s.len() {
            4 => u16::from_str_radix(s, 16)
                .map(Self::from_u16)
                .map_err(|e| Error::invalid_uuid(format!("{}: {}", s, e))),
            8 => u32::from_str_radix(s, 16)
                .map(Self::from_u32)
                .map_err(|e| Error::invalid_uuid(format!("{}: {}", s, e))),
            _ => Uuid::parse_str(s)
                .map(Self)
                .map_err(|e| Error::invalid_uuid(format!("{}: {}", s, e))),
        }
    }
}

impl TryFrom<String> for GattUuid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<&str> for GattUuid {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl From<GattUuid> for String {
    fn from(uuid: GattUuid) -> Self {
        uuid.to_string()
    }
}

impl From<Uuid> for GattUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<GattUuid> for Uuid {
    fn from(uuid: GattUuid) -> Self {
        uuid.0
    }
}

impl From<u16> for GattUuid {
    fn from(short: u16) -> Self {
        Self::from_u16(short)
    }
}
