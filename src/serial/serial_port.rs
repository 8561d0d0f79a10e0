use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::{DeviceOpener, LineSettings, ModemLines, SerialControl, SerialDevice};
use crate::{device::Handle, serial::error::SerialPortError};

fn try_create_serial_port(handle: &Handle, baud: u32) -> Result<SerialStream, SerialPortError> {
    let mut serial_stream = tokio_serial::new(handle.as_str(), baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;

    // Nobody is connected yet, so do not signal readiness to the device.
    serial_stream.write_request_to_send(false)?;

    Ok(serial_stream)
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl DeviceOpener for NativeOpener {
    fn open(
        &self,
        handle: &Handle,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialDevice>, SerialPortError> {
        info!(%handle, %baud_rate, "Opening serial port");

        let stream = try_create_serial_port(handle, baud_rate)?;

        Ok(Box::new(stream))
    }
}

impl SerialControl for SerialStream {
    fn settings(&self) -> Result<LineSettings, SerialPortError> {
        Ok(LineSettings {
            baud_rate: SerialPort::baud_rate(self)?,
            data_bits: SerialPort::data_bits(self)?,
            parity: SerialPort::parity(self)?,
            stop_bits: SerialPort::stop_bits(self)?,
            flow_control: SerialPort::flow_control(self)?,
        })
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        debug!(baud_rate, "Setting baud rate");
        Ok(SerialPort::set_baud_rate(self, baud_rate)?)
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), SerialPortError> {
        Ok(SerialPort::set_data_bits(self, data_bits)?)
    }

    fn set_parity(&mut self, parity: Parity) -> Result<(), SerialPortError> {
        Ok(SerialPort::set_parity(self, parity)?)
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), SerialPortError> {
        Ok(SerialPort::set_stop_bits(self, stop_bits)?)
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), SerialPortError> {
        Ok(SerialPort::set_flow_control(self, flow_control)?)
    }

    fn write_rts(&mut self, level: bool) -> Result<(), SerialPortError> {
        Ok(self.write_request_to_send(level)?)
    }

    fn write_dtr(&mut self, level: bool) -> Result<(), SerialPortError> {
        Ok(self.write_data_terminal_ready(level)?)
    }

    fn set_break(&mut self, on: bool) -> Result<(), SerialPortError> {
        if on {
            Ok(SerialPort::set_break(self)?)
        } else {
            Ok(self.clear_break()?)
        }
    }

    fn modem_lines(&mut self) -> Result<ModemLines, SerialPortError> {
        Ok(ModemLines {
            cts: self.read_clear_to_send()?,
            dsr: self.read_data_set_ready()?,
            ri: self.read_ring_indicator()?,
            cd: self.read_carrier_detect()?,
        })
    }

    fn purge(&mut self, buffer: ClearBuffer) -> Result<(), SerialPortError> {
        Ok(self.clear(buffer)?)
    }
}
