use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Where a device sits in the bus topology, e.g. `1-1.2:1.0`.
///
/// Survives unplug/replug on the same physical port,
/// which makes it the key for everything persisted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(String);

impl Location {
    /// Create a location.
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Location {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for Location {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The OS device path, e.g. `/dev/ttyUSB0`.
///
/// May change between plug events even when the [`Location`] does not.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Create a handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Borrowed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last path component, e.g. `ttyUSB0`.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reduce log verbosity
        let handle = self.0.strip_prefix("/dev/").unwrap_or(&self.0);

        write!(f, "{handle}")
    }
}

/// A device slot as seen by one discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlot {
    /// The durable key.
    pub location: Location,

    /// The device path right now.
    pub handle: Handle,

    /// The TCP port assigned to this slot.
    pub port: u16,

    /// The effective baud rate.
    pub baud_rate: u32,
}

impl Display for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} -> :{} ({} baud)",
            self.handle, self.location, self.port, self.baud_rate
        )
    }
}
