//! Device identity types

use std::fmt;

/// Identifier of a device session assigned by backend discovery.
///
/// `DeviceHandle::INVALID` (-1) is reserved and never refers to a device.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct DeviceHandle(i16);

impl DeviceHandle {
    /// Reserved invalid handle
    pub const INVALID: DeviceHandle = DeviceHandle(-1);

    pub fn new(raw: i16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i16 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport a backend controller drives.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum BackendType {
    /// Wi-Fi / IP network
    Net,
    /// Bluetooth Low Energy
    Ble,
    /// Multiplexed tunnel through a remote controller
    Mux,
    /// Unknown or simulated transport
    Unknown,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendType::Net => "net",
            BackendType::Ble => "ble",
            BackendType::Mux => "mux",
            BackendType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A device reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique identifier (serial number)
    pub uid: String,
    /// Model identifier
    pub device_type: i32,
    /// Transport the device was discovered on
    pub backend_type: BackendType,
    /// Human readable name
    pub name: String,
    /// Session handle
    pub handle: DeviceHandle,
}

/// API level offered by a connected device.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum ApiCapabilities {
    /// Capabilities were not reported
    Unknown = 0,
    /// Full API available
    Full = 1,
    /// Only firmware update is available
    UpdateOnly = 2,
}

impl ApiCapabilities {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ApiCapabilities::Full,
            2 => ApiCapabilities::UpdateOnly,
            _ => ApiCapabilities::Unknown,
        }
    }
}
