use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{announce::AnnounceMode, discovery, error::Error};

/// The configuration used for running the gateway.
///
/// Every field may be omitted in a file, falling back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The lowest TCP port handed out.
    pub base_port: u16,

    /// Where forwarders listen.
    pub bind_address: IpAddr,

    /// Regular expression selecting device paths.
    pub device_pattern: String,

    /// File remembering location to port assignments.
    pub port_map: PathBuf,

    /// File remembering per-port baud rate overrides.
    pub baud_map: PathBuf,

    /// Baud rate for ports without an override.
    pub default_baud_rate: u32,

    /// Seconds between device scans.
    pub discovery_interval_secs: u64,

    /// Seconds between purges of entries for absent devices.
    /// Never purged if not set.
    pub cleanup_interval_secs: Option<u64>,

    /// Where the control server listens.
    pub control_address: SocketAddr,

    /// Whether to run the control server at all.
    pub control_enabled: bool,

    /// How ports are advertised.
    pub announce: AnnounceMode,

    /// Host name to advertise. The system host name if not set.
    pub announce_host: Option<String>,

    /// Mount point of sysfs.
    pub sysfs_root: PathBuf,
}

/// The default control server address.
pub const DEFAULT_CONTROL_ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 3123);

impl Default for Config {
    fn default() -> Self {
        Self {
            base_port: 7000,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            device_pattern: discovery::DEFAULT_PATTERN.into(),
            port_map: "ports.ron".into(),
            baud_map: "baudrates.ron".into(),
            default_baud_rate: 115_200,
            discovery_interval_secs: 1,
            cleanup_interval_secs: None,
            control_address: SocketAddr::from(DEFAULT_CONTROL_ADDRESS),
            control_enabled: true,
            announce: AnnounceMode::default(),
            announce_host: None,
            sysfs_root: "/sys".into(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            base_port: 4000,
            port_map: "/var/lib/serial-dock/ports.ron".into(),
            baud_map: "/var/lib/serial-dock/baudrates.ron".into(),
            cleanup_interval_secs: Some(24 * 60 * 60),
            announce: AnnounceMode::Avahi,
            announce_host: Some("lab-bench-3".into()),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_else(|e| format!("Could not serialize configuration: {e}"))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// Time between device scans.
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    /// Time between cleanups, if enabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn check_pattern(&self) -> Result<(), Error> {
        discovery::compile(&self.device_pattern)
            .map(|_| ())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    fn check_numbers(&self) -> Result<(), Error> {
        if self.base_port == 0 {
            return Err(Error::BadConfig(
                "The base port must be above zero".into(),
            ));
        }

        if self.default_baud_rate == 0 {
            return Err(Error::BadConfig(
                "The default baud rate must be above zero".into(),
            ));
        }

        if self.discovery_interval_secs == 0 {
            return Err(Error::BadConfig(
                "The discovery interval must be at least one second".into(),
            ));
        }

        Ok(())
    }

    /// Check that the gateway can run with this configuration.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_pattern()?;
        self.check_numbers()?;

        Ok(())
    }
}
