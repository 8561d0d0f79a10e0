use std::io;

use thiserror::Error;

/// Problems talking to a serial device.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem: {0}")]
    IO(#[from] io::Error),

    /// Errors from the serial port driver.
    #[error("Serial port problem: {0}")]
    Serial(#[from] serialport::Error),

    /// The requested setting is not supported by the device or driver.
    #[error("Unsupported setting: {0}")]
    Unsupported(String),
}
