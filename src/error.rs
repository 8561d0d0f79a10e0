use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
///
/// These are serializable since command outcomes
/// travel back over the control channel.
#[derive(Debug, Error, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub enum Error {
    /// No live forwarder owns the requested port or location.
    #[error("No forwarder owns `{0}`")]
    NoSuchForwarder(String),

    /// The serial device could not be opened.
    #[error("Could not open serial device `{handle}`. Problem: {problem}")]
    OpenSerial {
        /// The device handle, e.g. `/dev/ttyUSB0`.
        handle: String,

        /// What went wrong.
        problem: String,
    },

    /// The TCP listener could not be set up.
    #[error("Could not listen on port {port}. Problem: {problem}")]
    Bind {
        /// The TCP port.
        port: u16,

        /// What went wrong.
        problem: String,
    },

    /// Every port from the base port and up is taken.
    #[error("No free TCP port at or above {0}")]
    PortsExhausted(u16),

    /// The device matching pattern is not a valid regular expression.
    #[error("Bad device pattern `{pattern}`. Problem: {problem}")]
    BadPattern {
        /// The offending pattern.
        pattern: String,

        /// Why it did not compile.
        problem: String,
    },

    /// A configuration value is unusable.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A control command could not be understood.
    #[error("Bad command: {0}")]
    BadCommand(String),

    /// Serial devices could not be enumerated.
    #[error("Could not enumerate serial devices. Problem: {0}")]
    Scan(String),

    /// Rebinding the USB driver failed.
    #[error("Could not reattach driver for `{location}`. Problem: {problem}")]
    Reattach {
        /// The device location.
        location: String,

        /// What went wrong.
        problem: String,
    },

    /// Persisting a map failed.
    #[error("Could not persist `{path}`. Problem: {problem}")]
    Persist {
        /// The file path.
        path: String,

        /// What went wrong.
        problem: String,
    },

    /// The service announcement could not be published.
    #[error("Could not announce service. Problem: {0}")]
    Announce(String),

    /// Something went wrong within the gateway itself.
    #[error("Internal issue: {0}")]
    InternalIssue(String),
}

impl Error {
    /// Get the configuration problem, if this is one.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}
