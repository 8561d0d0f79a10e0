use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::device::Handle;

/// Serial port related errors.
pub(crate) mod error;

/// The native serial port driver.
pub(crate) mod serial_port;

pub use error::SerialPortError;
pub use serial_port::NativeOpener;

/// The line configuration of a serial port.
///
/// Taken as a snapshot when a client connects and
/// written back when it leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    /// Bits per second.
    pub baud_rate: u32,

    /// Bits per character.
    pub data_bits: DataBits,

    /// Parity checking.
    pub parity: Parity,

    /// Stop bits per character.
    pub stop_bits: StopBits,

    /// Flow control mode.
    pub flow_control: FlowControl,
}

impl LineSettings {
    /// 8N1 at the given rate, no flow control.
    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// The input modem lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemLines {
    /// Clear to send.
    pub cts: bool,

    /// Data set ready.
    pub dsr: bool,

    /// Ring indicator.
    pub ri: bool,

    /// Carrier detect.
    pub cd: bool,
}

/// Everything besides moving bytes that a forwarder does to a serial device.
pub trait SerialControl {
    /// Read the current line configuration.
    fn settings(&self) -> Result<LineSettings, SerialPortError>;

    /// Write back a full line configuration.
    fn apply(&mut self, settings: &LineSettings) -> Result<(), SerialPortError> {
        self.set_baud_rate(settings.baud_rate)?;
        self.set_data_bits(settings.data_bits)?;
        self.set_parity(settings.parity)?;
        self.set_stop_bits(settings.stop_bits)?;
        self.set_flow_control(settings.flow_control)
    }

    /// Change the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError>;

    /// Change the character size.
    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), SerialPortError>;

    /// Change the parity.
    fn set_parity(&mut self, parity: Parity) -> Result<(), SerialPortError>;

    /// Change the stop bits.
    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), SerialPortError>;

    /// Change the flow control.
    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), SerialPortError>;

    /// Drive the RTS line.
    fn write_rts(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Drive the DTR line.
    fn write_dtr(&mut self, level: bool) -> Result<(), SerialPortError>;

    /// Start or stop sending a break.
    fn set_break(&mut self, on: bool) -> Result<(), SerialPortError>;

    /// Sample the input modem lines.
    fn modem_lines(&mut self) -> Result<ModemLines, SerialPortError>;

    /// Discard pending data in the driver's buffers.
    fn purge(&mut self, buffer: ClearBuffer) -> Result<(), SerialPortError>;
}

/// An open serial device: a byte stream with line control.
pub trait SerialDevice: AsyncRead + AsyncWrite + SerialControl + Send + Unpin {}

impl<T> SerialDevice for T where T: AsyncRead + AsyncWrite + SerialControl + Send + Unpin {}

/// Opens serial devices by handle.
pub trait DeviceOpener: Send + Sync {
    /// Open `handle` at `baud_rate`, 8N1, no flow control.
    fn open(&self, handle: &Handle, baud_rate: u32)
        -> Result<Box<dyn SerialDevice>, SerialPortError>;
}
