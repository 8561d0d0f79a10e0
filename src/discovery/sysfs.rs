use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    device::{Handle, Location},
    error::Error,
};

fn subsystem(device: &Path) -> Option<String> {
    let subsystem = fs::canonicalize(device.join("subsystem")).ok()?;

    Some(subsystem.file_name()?.to_string_lossy().into_owned())
}

/// The USB interface a tty belongs to, e.g. `1-1.2:1.0`.
///
/// `ttyUSB` devices hang below their interface, `ttyACM` devices are the interface.
pub fn location_of(sysfs_root: &Path, handle: &Handle) -> Option<Location> {
    let device = sysfs_root
        .join("class/tty")
        .join(handle.name())
        .join("device");
    let device = fs::canonicalize(device).ok()?;

    let interface: PathBuf = if subsystem(&device).as_deref() == Some("usb-serial") {
        device.parent()?.to_path_buf()
    } else {
        device
    };

    if subsystem(&interface).as_deref() != Some("usb") {
        debug!(%handle, ?interface, "Not a USB interface");
        return None;
    }

    let name = interface.file_name()?.to_string_lossy();
    Some(Location::new(name))
}

/// Unbind and rebind the USB driver of the interface at `location`.
pub async fn reattach_driver(sysfs_root: &Path, location: &Location) -> Result<(), Error> {
    let failed = |problem: String| Error::Reattach {
        location: location.to_string(),
        problem,
    };

    let device = sysfs_root.join("bus/usb/devices").join(location.as_str());
    let driver = tokio::fs::canonicalize(device.join("driver"))
        .await
        .map_err(|e| failed(format!("no driver bound: {e}")))?;

    tokio::fs::write(driver.join("unbind"), location.as_str())
        .await
        .map_err(|e| failed(format!("unbind: {e}")))?;
    tokio::fs::write(driver.join("bind"), location.as_str())
        .await
        .map_err(|e| failed(format!("bind: {e}")))?;

    info!(%location, ?driver, "Driver reattached");

    Ok(())
}
