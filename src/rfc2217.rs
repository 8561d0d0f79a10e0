//! Server side of RFC 2217 (Telnet COM-PORT-OPTION).
//!
//! A [`PortManager`] lives as long as one client connection.
//! Bytes from the network go through [`PortManager::filter`], which strips
//! Telnet commands, acts on them and returns the remaining payload.
//! Answers for the client accumulate internally and are drained with
//! [`PortManager::take_replies`].
//! Bytes from the serial device go through [`escape`] before being sent.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tracing::{debug, info, trace, warn};

use crate::serial::{LineSettings, SerialControl};

/// Interpret as command.
pub const IAC: u8 = 255;
/// Refuse a peer option.
pub const DONT: u8 = 254;
/// Ask the peer to enable an option.
pub const DO: u8 = 253;
/// Refuse to enable an option.
pub const WONT: u8 = 252;
/// Offer to enable an option.
pub const WILL: u8 = 251;
/// Subnegotiation begin.
pub const SB: u8 = 250;
/// Subnegotiation end.
pub const SE: u8 = 240;

/// Binary transmission.
pub const BINARY: u8 = 0;
/// Echo.
pub const ECHO: u8 = 1;
/// Suppress go ahead.
pub const SGA: u8 = 3;
/// RFC 2217 itself.
pub const COM_PORT_OPTION: u8 = 44;

/// Client to server subnegotiation codes.
/// The server answers with the same code plus [`SERVER_OFFSET`].
pub mod code {
    /// Identify the peer.
    pub const SIGNATURE: u8 = 0;
    /// Four bytes, big endian. Zero queries.
    pub const SET_BAUDRATE: u8 = 1;
    /// Five to eight. Zero queries.
    pub const SET_DATASIZE: u8 = 2;
    /// See [`super::parity`].
    pub const SET_PARITY: u8 = 3;
    /// See [`super::stopsize`].
    pub const SET_STOPSIZE: u8 = 4;
    /// See [`super::control`].
    pub const SET_CONTROL: u8 = 5;
    /// Ask for the line state.
    pub const NOTIFY_LINESTATE: u8 = 6;
    /// Ask for the modem state.
    pub const NOTIFY_MODEMSTATE: u8 = 7;
    /// Stop sending data to the client.
    pub const FLOWCONTROL_SUSPEND: u8 = 8;
    /// Resume sending data to the client.
    pub const FLOWCONTROL_RESUME: u8 = 9;
    /// Which line state changes to report.
    pub const SET_LINESTATE_MASK: u8 = 10;
    /// Which modem state changes to report.
    pub const SET_MODEMSTATE_MASK: u8 = 11;
    /// See [`super::purge`].
    pub const PURGE_DATA: u8 = 12;
}

/// Added to a client code to form the server's answer.
pub const SERVER_OFFSET: u8 = 100;

/// Longest subnegotiation kept. COM-PORT-OPTION values are a few bytes,
/// anything longer is dropped unread.
pub const MAX_SUBNEGOTIATION_LEN: usize = 64;

/// Values of `SET-PARITY`.
pub mod parity {
    /// No parity.
    pub const NONE: u8 = 1;
    /// Odd parity.
    pub const ODD: u8 = 2;
    /// Even parity.
    pub const EVEN: u8 = 3;
}

/// Values of `SET-STOPSIZE`.
pub mod stopsize {
    /// One stop bit.
    pub const ONE: u8 = 1;
    /// Two stop bits.
    pub const TWO: u8 = 2;
}

/// Values of `SET-CONTROL`.
pub mod control {
    /// Query flow control.
    pub const REQ_FLOW_SETTING: u8 = 0;
    /// No flow control.
    pub const USE_NO_FLOW_CONTROL: u8 = 1;
    /// XON/XOFF.
    pub const USE_SW_FLOW_CONTROL: u8 = 2;
    /// RTS/CTS.
    pub const USE_HW_FLOW_CONTROL: u8 = 3;
    /// Query break.
    pub const REQ_BREAK_STATE: u8 = 4;
    /// Break on.
    pub const BREAK_ON: u8 = 5;
    /// Break off.
    pub const BREAK_OFF: u8 = 6;
    /// Query DTR.
    pub const REQ_DTR: u8 = 7;
    /// DTR on.
    pub const DTR_ON: u8 = 8;
    /// DTR off.
    pub const DTR_OFF: u8 = 9;
    /// Query RTS.
    pub const REQ_RTS: u8 = 10;
    /// RTS on.
    pub const RTS_ON: u8 = 11;
    /// RTS off.
    pub const RTS_OFF: u8 = 12;
}

/// Values of `PURGE-DATA`.
pub mod purge {
    /// Data received from the device, not yet read.
    pub const RECEIVE: u8 = 1;
    /// Data written to the device, not yet sent.
    pub const TRANSMIT: u8 = 2;
    /// Both.
    pub const BOTH: u8 = 3;
}

/// Bits of `NOTIFY-MODEMSTATE`.
pub mod modemstate {
    /// CTS changed.
    pub const DELTA_CTS: u8 = 0x01;
    /// DSR changed.
    pub const DELTA_DSR: u8 = 0x02;
    /// RI trailing edge.
    pub const TRAILING_EDGE_RI: u8 = 0x04;
    /// CD changed.
    pub const DELTA_CD: u8 = 0x08;
    /// Clear to send.
    pub const CTS: u8 = 0x10;
    /// Data set ready.
    pub const DSR: u8 = 0x20;
    /// Ring indicator.
    pub const RI: u8 = 0x40;
    /// Carrier detect.
    pub const CD: u8 = 0x80;
}

/// Double every [`IAC`] so payload bytes are not read as commands.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());

    for &byte in data {
        escaped.push(byte);
        if byte == IAC {
            escaped.push(IAC);
        }
    }

    escaped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionState {
    Requested,
    Active,
    Inactive,
    ReallyInactive,
}

#[derive(Debug)]
struct TelnetOption {
    name: &'static str,
    option: u8,
    send_yes: u8,
    send_no: u8,
    ack_yes: u8,
    ack_no: u8,
    state: OptionState,
}

impl TelnetOption {
    /// An option we perform (WILL/WONT, answered by DO/DONT).
    fn ours(name: &'static str, option: u8, state: OptionState) -> Self {
        Self {
            name,
            option,
            send_yes: WILL,
            send_no: WONT,
            ack_yes: DO,
            ack_no: DONT,
            state,
        }
    }

    /// An option the client performs (DO/DONT, answered by WILL/WONT).
    fn theirs(name: &'static str, option: u8, state: OptionState) -> Self {
        Self {
            name,
            option,
            send_yes: DO,
            send_no: DONT,
            ack_yes: WILL,
            ack_no: WONT,
            state,
        }
    }

    /// React to the peer's command. Returns what to send back, if anything.
    fn process(&mut self, command: u8) -> Option<u8> {
        let reply = if command == self.ack_yes {
            match self.state {
                OptionState::Requested => {
                    self.state = OptionState::Active;
                    None
                }
                OptionState::Active => None,
                OptionState::Inactive => {
                    self.state = OptionState::Active;
                    Some(self.send_yes)
                }
                OptionState::ReallyInactive => Some(self.send_no),
            }
        } else if command == self.ack_no {
            match self.state {
                OptionState::Requested => {
                    self.state = OptionState::Inactive;
                    None
                }
                OptionState::Active => {
                    self.state = OptionState::Inactive;
                    Some(self.send_no)
                }
                OptionState::Inactive | OptionState::ReallyInactive => None,
            }
        } else {
            None
        };

        trace!(option = self.name, state = ?self.state, "Negotiated");
        reply
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    IacSeen,
    Negotiate(u8),
}

/// The RFC 2217 state of one client session.
#[derive(Debug)]
pub struct PortManager {
    options: Vec<TelnetOption>,
    mode: Mode,
    suboption: Option<Vec<u8>>,
    discarding: bool,
    replies: Vec<u8>,

    client_is_rfc2217: bool,
    linestate_mask: u8,
    modemstate_mask: u8,
    last_modemstate: Option<u8>,
    output_suspended: bool,

    rts: bool,
    dtr: bool,
    break_on: bool,
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PortManager {
    /// Start a session.
    ///
    /// The control lines are assumed asserted, as done when a client is adopted.
    /// The initial option requests are queued as replies.
    pub fn new() -> Self {
        let mut manager = Self {
            options: vec![
                TelnetOption::ours("ECHO", ECHO, OptionState::Requested),
                TelnetOption::ours("we-SGA", SGA, OptionState::Requested),
                TelnetOption::theirs("they-SGA", SGA, OptionState::Inactive),
                TelnetOption::ours("we-BINARY", BINARY, OptionState::Inactive),
                TelnetOption::theirs("they-BINARY", BINARY, OptionState::Requested),
                TelnetOption::ours("we-RFC2217", COM_PORT_OPTION, OptionState::Requested),
                TelnetOption::theirs("they-RFC2217", COM_PORT_OPTION, OptionState::Inactive),
            ],
            mode: Mode::Normal,
            suboption: None,
            discarding: false,
            replies: vec![],
            client_is_rfc2217: false,
            linestate_mask: 0,
            modemstate_mask: 0xFF,
            last_modemstate: None,
            output_suspended: false,
            rts: true,
            dtr: true,
            break_on: false,
        };

        let requested = manager
            .options
            .iter()
            .filter(|option| option.state == OptionState::Requested)
            .map(|option| [IAC, option.send_yes, option.option])
            .collect::<Vec<_>>();

        for request in requested {
            manager.replies.extend_from_slice(&request);
        }

        manager
    }

    /// Escape outbound serial data.
    pub fn escape(&self, data: &[u8]) -> Vec<u8> {
        escape(data)
    }

    /// Everything queued for the client since the last call.
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }

    /// Whether the client sent any COM-PORT-OPTION subnegotiation.
    pub fn client_is_rfc2217(&self) -> bool {
        self.client_is_rfc2217
    }

    /// Whether the client asked us to hold back data.
    pub fn output_suspended(&self) -> bool {
        self.output_suspended
    }

    /// Strip and act on Telnet commands in `data`, returning the payload.
    ///
    /// State is kept between calls, so sequences split across reads work.
    pub fn filter<S>(&mut self, data: &[u8], serial: &mut S) -> Vec<u8>
    where
        S: SerialControl + ?Sized,
    {
        let mut payload = Vec::with_capacity(data.len());

        for &byte in data {
            match self.mode {
                Mode::Normal => {
                    if byte == IAC {
                        self.mode = Mode::IacSeen;
                    } else if self.in_subnegotiation() {
                        self.push_suboption(byte);
                    } else {
                        payload.push(byte);
                    }
                }
                Mode::IacSeen => {
                    self.mode = Mode::Normal;

                    match byte {
                        IAC if self.in_subnegotiation() => self.push_suboption(IAC),
                        IAC => payload.push(IAC),
                        SB => {
                            self.suboption = Some(vec![]);
                            self.discarding = false;
                        }
                        SE => {
                            self.discarding = false;
                            if let Some(suboption) = self.suboption.take() {
                                self.subnegotiate(&suboption, serial);
                            }
                        }
                        DO | DONT | WILL | WONT => self.mode = Mode::Negotiate(byte),
                        other => trace!(command = other, "Ignoring telnet command"),
                    }
                }
                Mode::Negotiate(command) => {
                    self.negotiate(command, byte);
                    self.mode = Mode::Normal;
                }
            }
        }

        payload
    }

    fn in_subnegotiation(&self) -> bool {
        self.suboption.is_some() || self.discarding
    }

    /// Bytes past [`MAX_SUBNEGOTIATION_LEN`] drop the whole subnegotiation,
    /// the rest of it is skipped up to `IAC SE`.
    fn push_suboption(&mut self, byte: u8) {
        let Some(suboption) = &mut self.suboption else {
            return;
        };

        if suboption.len() < MAX_SUBNEGOTIATION_LEN {
            suboption.push(byte);
        } else {
            warn!(
                limit = MAX_SUBNEGOTIATION_LEN,
                "Subnegotiation too long, dropping it"
            );
            self.suboption = None;
            self.discarding = true;
        }
    }

    fn negotiate(&mut self, command: u8, option: u8) {
        let mut known = false;
        let mut answers = vec![];

        for telnet_option in self
            .options
            .iter_mut()
            .filter(|o| o.option == option && (command == o.ack_yes || command == o.ack_no))
        {
            known = true;
            if let Some(answer) = telnet_option.process(command) {
                answers.push(answer);
            }
        }

        if !known && (command == WILL || command == DO) {
            debug!(option, command, "Refusing unknown option");
            answers.push(if command == WILL { DONT } else { WONT });
        }

        for answer in answers {
            self.replies.extend_from_slice(&[IAC, answer, option]);
        }
    }

    fn send_subnegotiation(&mut self, code: u8, value: &[u8]) {
        self.replies
            .extend_from_slice(&[IAC, SB, COM_PORT_OPTION, code + SERVER_OFFSET]);
        self.replies.extend(escape(value));
        self.replies.extend_from_slice(&[IAC, SE]);
    }

    fn current<S>(serial: &S) -> Option<LineSettings>
    where
        S: SerialControl + ?Sized,
    {
        match serial.settings() {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(%e, "Could not read line settings");
                None
            }
        }
    }

    fn subnegotiate<S>(&mut self, suboption: &[u8], serial: &mut S)
    where
        S: SerialControl + ?Sized,
    {
        let (Some(&COM_PORT_OPTION), Some(&command)) = (suboption.first(), suboption.get(1)) else {
            debug!(?suboption, "Ignoring subnegotiation");
            return;
        };

        if !self.client_is_rfc2217 {
            info!("Client speaks RFC 2217");
            self.client_is_rfc2217 = true;
        }

        let value = &suboption[2..];
        let first = value.first().copied();

        match command {
            code::SIGNATURE => {
                let signature = format!("serial-dock {}", env!("CARGO_PKG_VERSION"));
                self.send_subnegotiation(code::SIGNATURE, signature.as_bytes());
            }
            code::SET_BAUDRATE => {
                let Ok(bytes) = <[u8; 4]>::try_from(value) else {
                    warn!(?value, "Malformed baud rate");
                    return;
                };
                let requested = u32::from_be_bytes(bytes);

                if requested != 0 {
                    match serial.set_baud_rate(requested) {
                        Ok(()) => info!(requested, "Baud rate changed by client"),
                        Err(e) => warn!(%e, requested, "Baud rate rejected"),
                    }
                }

                if let Some(settings) = Self::current(serial) {
                    self.send_subnegotiation(code::SET_BAUDRATE, &settings.baud_rate.to_be_bytes());
                }
            }
            code::SET_DATASIZE => {
                let requested = match first {
                    Some(0) | None => None,
                    Some(5) => Some(DataBits::Five),
                    Some(6) => Some(DataBits::Six),
                    Some(7) => Some(DataBits::Seven),
                    Some(8) => Some(DataBits::Eight),
                    Some(other) => {
                        warn!(other, "Unsupported data size");
                        None
                    }
                };

                if let Some(data_bits) = requested {
                    match serial.set_data_bits(data_bits) {
                        Ok(()) => info!(?data_bits, "Data size changed by client"),
                        Err(e) => warn!(%e, ?data_bits, "Data size rejected"),
                    }
                }

                if let Some(settings) = Self::current(serial) {
                    let size = match settings.data_bits {
                        DataBits::Five => 5,
                        DataBits::Six => 6,
                        DataBits::Seven => 7,
                        DataBits::Eight => 8,
                    };
                    self.send_subnegotiation(code::SET_DATASIZE, &[size]);
                }
            }
            code::SET_PARITY => {
                let requested = match first {
                    Some(0) | None => None,
                    Some(parity::NONE) => Some(Parity::None),
                    Some(parity::ODD) => Some(Parity::Odd),
                    Some(parity::EVEN) => Some(Parity::Even),
                    Some(other) => {
                        warn!(other, "Unsupported parity");
                        None
                    }
                };

                if let Some(parity) = requested {
                    match serial.set_parity(parity) {
                        Ok(()) => info!(?parity, "Parity changed by client"),
                        Err(e) => warn!(%e, ?parity, "Parity rejected"),
                    }
                }

                if let Some(settings) = Self::current(serial) {
                    let value = match settings.parity {
                        Parity::None => parity::NONE,
                        Parity::Odd => parity::ODD,
                        Parity::Even => parity::EVEN,
                    };
                    self.send_subnegotiation(code::SET_PARITY, &[value]);
                }
            }
            code::SET_STOPSIZE => {
                let requested = match first {
                    Some(0) | None => None,
                    Some(stopsize::ONE) => Some(StopBits::One),
                    Some(stopsize::TWO) => Some(StopBits::Two),
                    Some(other) => {
                        warn!(other, "Unsupported stop size");
                        None
                    }
                };

                if let Some(stop_bits) = requested {
                    match serial.set_stop_bits(stop_bits) {
                        Ok(()) => info!(?stop_bits, "Stop size changed by client"),
                        Err(e) => warn!(%e, ?stop_bits, "Stop size rejected"),
                    }
                }

                if let Some(settings) = Self::current(serial) {
                    let value = match settings.stop_bits {
                        StopBits::One => stopsize::ONE,
                        StopBits::Two => stopsize::TWO,
                    };
                    self.send_subnegotiation(code::SET_STOPSIZE, &[value]);
                }
            }
            code::SET_CONTROL => self.set_control(first, serial),
            code::NOTIFY_LINESTATE => {
                // Line errors are not observable through the driver.
                self.send_subnegotiation(code::NOTIFY_LINESTATE, &[0]);
            }
            code::NOTIFY_MODEMSTATE => self.check_modem_lines(serial, true),
            code::FLOWCONTROL_SUSPEND => {
                debug!("Client suspended output");
                self.output_suspended = true;
            }
            code::FLOWCONTROL_RESUME => {
                debug!("Client resumed output");
                self.output_suspended = false;
            }
            code::SET_LINESTATE_MASK => {
                self.linestate_mask = first.unwrap_or(0);
                self.send_subnegotiation(code::SET_LINESTATE_MASK, &[self.linestate_mask]);
            }
            code::SET_MODEMSTATE_MASK => {
                self.modemstate_mask = first.unwrap_or(0);
                self.send_subnegotiation(code::SET_MODEMSTATE_MASK, &[self.modemstate_mask]);
            }
            code::PURGE_DATA => {
                let buffer = match first {
                    Some(purge::RECEIVE) => ClearBuffer::Input,
                    Some(purge::TRANSMIT) => ClearBuffer::Output,
                    Some(purge::BOTH) => ClearBuffer::All,
                    other => {
                        warn!(?other, "Unsupported purge request");
                        return;
                    }
                };

                if let Err(e) = serial.purge(buffer) {
                    warn!(%e, ?buffer, "Purge failed");
                }
                self.send_subnegotiation(code::PURGE_DATA, &[first.unwrap_or_default()]);
            }
            other => warn!(command = other, "Unknown COM-PORT-OPTION command"),
        }
    }

    fn set_control<S>(&mut self, value: Option<u8>, serial: &mut S)
    where
        S: SerialControl + ?Sized,
    {
        let Some(value) = value else {
            warn!("SET-CONTROL without a value");
            return;
        };

        let flow_control = match value {
            control::USE_NO_FLOW_CONTROL => Some(FlowControl::None),
            control::USE_SW_FLOW_CONTROL => Some(FlowControl::Software),
            control::USE_HW_FLOW_CONTROL => Some(FlowControl::Hardware),
            _ => None,
        };

        let reply = match value {
            control::REQ_FLOW_SETTING
            | control::USE_NO_FLOW_CONTROL
            | control::USE_SW_FLOW_CONTROL
            | control::USE_HW_FLOW_CONTROL => {
                if let Some(flow_control) = flow_control {
                    match serial.set_flow_control(flow_control) {
                        Ok(()) => info!(?flow_control, "Flow control changed by client"),
                        Err(e) => warn!(%e, ?flow_control, "Flow control rejected"),
                    }
                }

                Self::current(serial).map(|settings| match settings.flow_control {
                    FlowControl::None => control::USE_NO_FLOW_CONTROL,
                    FlowControl::Software => control::USE_SW_FLOW_CONTROL,
                    FlowControl::Hardware => control::USE_HW_FLOW_CONTROL,
                })
            }
            control::BREAK_ON | control::BREAK_OFF => {
                let on = value == control::BREAK_ON;
                match serial.set_break(on) {
                    Ok(()) => self.break_on = on,
                    Err(e) => warn!(%e, on, "Break change failed"),
                }
                Some(value)
            }
            control::REQ_BREAK_STATE => Some(if self.break_on {
                control::BREAK_ON
            } else {
                control::BREAK_OFF
            }),
            control::DTR_ON | control::DTR_OFF => {
                let level = value == control::DTR_ON;
                match serial.write_dtr(level) {
                    Ok(()) => self.dtr = level,
                    Err(e) => warn!(%e, level, "DTR change failed"),
                }
                Some(value)
            }
            control::REQ_DTR => Some(if self.dtr {
                control::DTR_ON
            } else {
                control::DTR_OFF
            }),
            control::RTS_ON | control::RTS_OFF => {
                let level = value == control::RTS_ON;
                match serial.write_rts(level) {
                    Ok(()) => self.rts = level,
                    Err(e) => warn!(%e, level, "RTS change failed"),
                }
                Some(value)
            }
            control::REQ_RTS => Some(if self.rts {
                control::RTS_ON
            } else {
                control::RTS_OFF
            }),
            other => {
                warn!(other, "Unsupported SET-CONTROL value");
                None
            }
        };

        if let Some(reply) = reply {
            self.send_subnegotiation(code::SET_CONTROL, &[reply]);
        }
    }

    /// Sample the modem lines and report changes to the client.
    ///
    /// Reports only once the client has shown it speaks RFC 2217,
    /// unless `force` is set.
    pub fn check_modem_lines<S>(&mut self, serial: &mut S, force: bool)
    where
        S: SerialControl + ?Sized,
    {
        let lines = match serial.modem_lines() {
            Ok(lines) => lines,
            Err(e) => {
                debug!(%e, "Could not read modem lines");
                return;
            }
        };

        let mut state = 0;
        if lines.cts {
            state |= modemstate::CTS;
        }
        if lines.dsr {
            state |= modemstate::DSR;
        }
        if lines.ri {
            state |= modemstate::RI;
        }
        if lines.cd {
            state |= modemstate::CD;
        }

        let deltas = state ^ self.last_modemstate.unwrap_or(0);
        if deltas & modemstate::CTS != 0 {
            state |= modemstate::DELTA_CTS;
        }
        if deltas & modemstate::DSR != 0 {
            state |= modemstate::DELTA_DSR;
        }
        if deltas & modemstate::RI != 0 {
            state |= modemstate::TRAILING_EDGE_RI;
        }
        if deltas & modemstate::CD != 0 {
            state |= modemstate::DELTA_CD;
        }

        if Some(state) != self.last_modemstate || force {
            if (self.client_is_rfc2217 && (state & self.modemstate_mask) != 0) || force {
                trace!(state, "Reporting modem state");
                self.send_subnegotiation(code::NOTIFY_MODEMSTATE, &[state & self.modemstate_mask]);
            }
            self.last_modemstate = Some(state & 0xF0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockDevice, serial::LineSettings};
    use pretty_assertions::assert_eq;

    fn device() -> MockDevice {
        MockDevice::pair(LineSettings::with_baud_rate(115_200)).0
    }

    fn subnegotiation(command: u8, value: &[u8]) -> Vec<u8> {
        let mut bytes = vec![IAC, SB, COM_PORT_OPTION, command];
        bytes.extend(escape(value));
        bytes.extend([IAC, SE]);
        bytes
    }

    #[test]
    fn escape_doubles_iac() {
        assert_eq!(escape(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
        assert_eq!(escape(b"plain"), b"plain".to_vec());
    }

    #[test]
    fn new_session_requests_options() {
        let mut manager = PortManager::new();

        assert_eq!(
            manager.take_replies(),
            vec![
                IAC, WILL, ECHO, //
                IAC, WILL, SGA, //
                IAC, DO, BINARY, //
                IAC, WILL, COM_PORT_OPTION,
            ]
        );
        assert!(manager.take_replies().is_empty());
    }

    #[test]
    fn plain_data_passes_through() {
        let mut manager = PortManager::new();
        let mut serial = device();

        assert_eq!(manager.filter(b"hello", &mut serial), b"hello".to_vec());
    }

    #[test]
    fn doubled_iac_is_a_literal_byte() {
        let mut manager = PortManager::new();
        let mut serial = device();

        assert_eq!(manager.filter(&[b'a', IAC, IAC, b'b'], &mut serial), vec![b'a', IAC, b'b']);
    }

    #[test]
    fn commands_split_across_reads() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        let mut request = subnegotiation(code::SET_BAUDRATE, &9600u32.to_be_bytes());
        request.insert(0, b'x');
        request.push(b'y');

        let (first, second) = request.split_at(5);
        let mut payload = manager.filter(first, &mut serial);
        payload.extend(manager.filter(second, &mut serial));

        assert_eq!(payload, b"xy".to_vec());
        assert_eq!(serial.line().settings.baud_rate, 9600);
    }

    #[test]
    fn oversized_subnegotiation_is_dropped() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        let mut flood = vec![IAC, SB, COM_PORT_OPTION, code::SET_BAUDRATE];
        flood.extend(std::iter::repeat(b'A').take(1024));

        assert!(manager.filter(&flood, &mut serial).is_empty());
        for _ in 0..64 {
            assert!(manager.filter(&flood[4..], &mut serial).is_empty());
        }

        let held = manager.suboption.as_ref().map_or(0, Vec::len);
        assert!(held <= MAX_SUBNEGOTIATION_LEN, "{held}");
        assert!(manager.take_replies().is_empty());
        assert_eq!(serial.line().settings.baud_rate, 115_200);

        // Back to normal after the terminator
        let mut rest = vec![IAC, SE];
        rest.extend(b"ok");
        rest.extend(subnegotiation(code::SET_BAUDRATE, &9600u32.to_be_bytes()));

        assert_eq!(manager.filter(&rest, &mut serial), b"ok".to_vec());
        assert_eq!(serial.line().settings.baud_rate, 9600);
    }

    #[test]
    fn set_baudrate_applies_and_answers() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        let payload = manager.filter(
            &subnegotiation(code::SET_BAUDRATE, &9600u32.to_be_bytes()),
            &mut serial,
        );

        assert!(payload.is_empty());
        assert!(manager.client_is_rfc2217());
        assert_eq!(serial.line().settings.baud_rate, 9600);
        assert_eq!(
            manager.take_replies(),
            subnegotiation(code::SET_BAUDRATE + SERVER_OFFSET, &9600u32.to_be_bytes())
        );
    }

    #[test]
    fn zero_baudrate_only_queries() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        manager.filter(&subnegotiation(code::SET_BAUDRATE, &[0, 0, 0, 0]), &mut serial);

        assert_eq!(serial.line().settings.baud_rate, 115_200);
        assert_eq!(
            manager.take_replies(),
            subnegotiation(code::SET_BAUDRATE + SERVER_OFFSET, &115_200u32.to_be_bytes())
        );
    }

    #[test]
    fn rejected_setting_reports_current_value() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        // Mark parity is not supported by the driver.
        manager.filter(&subnegotiation(code::SET_PARITY, &[4]), &mut serial);

        assert_eq!(serial.line().settings.parity, Parity::None);
        assert_eq!(
            manager.take_replies(),
            subnegotiation(code::SET_PARITY + SERVER_OFFSET, &[parity::NONE])
        );
    }

    #[test]
    fn line_settings_change() {
        let mut manager = PortManager::new();
        let mut serial = device();

        manager.filter(&subnegotiation(code::SET_DATASIZE, &[7]), &mut serial);
        manager.filter(&subnegotiation(code::SET_PARITY, &[parity::EVEN]), &mut serial);
        manager.filter(&subnegotiation(code::SET_STOPSIZE, &[stopsize::TWO]), &mut serial);
        manager.filter(
            &subnegotiation(code::SET_CONTROL, &[control::USE_HW_FLOW_CONTROL]),
            &mut serial,
        );

        let settings = serial.line().settings;
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert_eq!(settings.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn control_lines_and_queries() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        manager.filter(&subnegotiation(code::SET_CONTROL, &[control::RTS_OFF]), &mut serial);
        manager.filter(&subnegotiation(code::SET_CONTROL, &[control::DTR_OFF]), &mut serial);
        assert!(!serial.line().rts);
        assert!(!serial.line().dtr);
        manager.take_replies();

        manager.filter(&subnegotiation(code::SET_CONTROL, &[control::REQ_RTS]), &mut serial);
        assert_eq!(
            manager.take_replies(),
            subnegotiation(code::SET_CONTROL + SERVER_OFFSET, &[control::RTS_OFF])
        );

        manager.filter(&subnegotiation(code::SET_CONTROL, &[control::BREAK_ON]), &mut serial);
        assert!(serial.line().break_on);
    }

    #[test]
    fn purge_reaches_the_device() {
        let mut manager = PortManager::new();
        let mut serial = device();

        manager.filter(&subnegotiation(code::PURGE_DATA, &[purge::BOTH]), &mut serial);

        assert_eq!(serial.line().purges, 1);
    }

    #[test]
    fn unknown_options_are_refused() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        // Terminal type, window size
        manager.filter(&[IAC, WILL, 24, IAC, DO, 31], &mut serial);

        assert_eq!(manager.take_replies(), vec![IAC, DONT, 24, IAC, WONT, 31]);
    }

    #[test]
    fn acknowledgements_are_not_answered() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        manager.filter(
            &[IAC, DO, ECHO, IAC, DO, SGA, IAC, WILL, BINARY, IAC, DO, COM_PORT_OPTION],
            &mut serial,
        );

        assert!(manager.take_replies().is_empty());
    }

    #[test]
    fn inactive_option_is_enabled_on_request() {
        let mut manager = PortManager::new();
        manager.take_replies();
        let mut serial = device();

        manager.filter(&[IAC, DO, BINARY], &mut serial);

        assert_eq!(manager.take_replies(), vec![IAC, WILL, BINARY]);
    }

    #[test]
    fn modem_state_changes_are_reported() {
        let mut manager = PortManager::new();
        let mut serial = device();

        // Not an RFC 2217 client yet: nothing reported
        serial.line().modem.cts = true;
        manager.check_modem_lines(&mut serial, false);
        manager.take_replies();

        manager.filter(&subnegotiation(code::SET_MODEMSTATE_MASK, &[0xFF]), &mut serial);
        manager.take_replies();

        serial.line().modem.cd = true;
        manager.check_modem_lines(&mut serial, false);

        assert_eq!(
            manager.take_replies(),
            subnegotiation(
                code::NOTIFY_MODEMSTATE + SERVER_OFFSET,
                &[modemstate::CTS | modemstate::CD | modemstate::DELTA_CD]
            )
        );

        // Unchanged: silent
        manager.check_modem_lines(&mut serial, false);
        assert!(manager.take_replies().is_empty());
    }
}
