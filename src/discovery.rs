//! Finding serial devices and deciding which forwarders to start or stop.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::{
    device::{Handle, Location},
    error::Error,
};

/// Locating devices in the sysfs tree.
pub mod sysfs;

/// Matches USB serial adapters and CDC ACM devices.
pub const DEFAULT_PATTERN: &str = r"^/dev/tty(USB|ACM)[0-9]+$";

/// Lists the devices present right now.
pub trait DeviceScanner: Send {
    /// Location to handle, for every matching device.
    fn scan(&mut self) -> Result<BTreeMap<Location, Handle>, Error>;
}

/// Scans the system's serial ports.
#[derive(Debug)]
pub struct SerialScanner {
    pattern: Regex,
    sysfs_root: PathBuf,
}

impl SerialScanner {
    /// Match port names against `pattern`, locating them under `sysfs_root`.
    pub fn new(pattern: &str, sysfs_root: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self {
            pattern: compile(pattern)?,
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
        })
    }
}

/// Compile a device pattern.
pub fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::BadPattern {
        pattern: pattern.into(),
        problem: e.to_string(),
    })
}

impl DeviceScanner for SerialScanner {
    fn scan(&mut self) -> Result<BTreeMap<Location, Handle>, Error> {
        let ports = tokio_serial::available_ports().map_err(|e| Error::Scan(e.to_string()))?;

        let mut devices = BTreeMap::new();

        for handle in ports
            .into_iter()
            .map(|info| Handle::new(info.port_name))
            .filter(|handle| self.pattern.is_match(handle.as_str()))
        {
            let location = sysfs::location_of(&self.sysfs_root, &handle).unwrap_or_else(|| {
                trace!(%handle, "No USB interface, using the handle as location");
                Location::new(handle.as_str())
            });

            if let Some(previous) = devices.get(&location) {
                warn!(%location, %handle, %previous, "Two devices at one location, ignoring the latter");
                continue;
            }

            devices.insert(location, handle);
        }

        debug!(devices = devices.len(), "Scanned");

        Ok(devices)
    }
}

/// What one reconciliation should change.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Present but not owned, sorted.
    pub added: Vec<Location>,

    /// Owned but no longer present, sorted.
    pub removed: Vec<Location>,
}

impl Plan {
    /// Nothing to do.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff the present devices against the owned locations.
pub fn plan(present: &BTreeMap<Location, Handle>, owned: &BTreeSet<Location>) -> Plan {
    Plan {
        added: present
            .keys()
            .filter(|location| !owned.contains(*location))
            .cloned()
            .collect(),
        removed: owned
            .iter()
            .filter(|location| !present.contains_key(*location))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn present(entries: &[(&str, &str)]) -> BTreeMap<Location, Handle> {
        entries
            .iter()
            .map(|(location, handle)| (Location::new(*location), Handle::new(*handle)))
            .collect()
    }

    fn owned(locations: &[&str]) -> BTreeSet<Location> {
        locations.iter().copied().map(Location::from).collect()
    }

    #[test]
    fn default_pattern() {
        let pattern = compile(DEFAULT_PATTERN).unwrap();

        assert!(pattern.is_match("/dev/ttyUSB0"));
        assert!(pattern.is_match("/dev/ttyACM12"));
        assert!(!pattern.is_match("/dev/ttyS0"));
        assert!(!pattern.is_match("/dev/ttyUSB"));
    }

    #[test]
    fn bad_pattern() {
        assert!(matches!(compile("(["), Err(Error::BadPattern { .. })));
    }

    #[test]
    fn new_devices_are_added_in_order() {
        let plan = plan(
            &present(&[("1-2", "/dev/ttyUSB0"), ("1-1", "/dev/ttyUSB1")]),
            &owned(&[]),
        );

        assert_eq!(plan.added, vec![Location::new("1-1"), Location::new("1-2")]);
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn gone_devices_are_removed() {
        let plan = plan(&present(&[("1-2", "/dev/ttyUSB0")]), &owned(&["1-1", "1-2"]));

        assert!(plan.added.is_empty());
        assert_eq!(plan.removed, vec![Location::new("1-1")]);
    }

    #[test]
    fn renamed_handle_is_no_change() {
        let plan = plan(&present(&[("1-1", "/dev/ttyUSB7")]), &owned(&["1-1"]));

        assert!(plan.is_empty());
    }
}
