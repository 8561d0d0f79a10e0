//! Operator commands and what they result in.

use serde::{Deserialize, Serialize};

use crate::{device::Location, error::Error};

/// A command as it arrives over the control channel.
///
/// ```json
/// {"command": "set_baudrate", "port": 7001, "value": 9600}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// One of `restart`, `restart_id`, `reattach`, `reattach_id`, `set_baudrate`.
    pub command: String,

    /// Target port, for `restart`, `reattach` and `set_baudrate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Target location, for `restart_id` and `reattach_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// The new baud rate, for `set_baudrate`. Zero means the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
}

impl CommandMessage {
    fn new(command: &str) -> Self {
        Self {
            command: command.into(),
            port: None,
            location: None,
            value: None,
        }
    }

    /// Restart the forwarder on `port`.
    pub fn restart(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::new("restart")
        }
    }

    /// Restart the forwarder at `location`.
    pub fn restart_id(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::new("restart_id")
        }
    }

    /// Rebind the driver of the device on `port`.
    pub fn reattach(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::new("reattach")
        }
    }

    /// Rebind the driver of the device at `location`.
    pub fn reattach_id(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::new("reattach_id")
        }
    }

    /// Change the baud rate of `port`.
    pub fn set_baudrate(port: u16, value: u32) -> Self {
        Self {
            port: Some(port),
            value: Some(value),
            ..Self::new("set_baudrate")
        }
    }
}

/// Which forwarder a command is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// By TCP port.
    Port(u16),

    /// By device location.
    Location(Location),
}

/// A well formed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Close and reopen.
    Restart(Target),

    /// Unbind and rebind the USB driver.
    Reattach(Target),

    /// Persist a new baud rate and reopen with it.
    SetBaudRate {
        /// The TCP port.
        port: u16,

        /// The rate, zero for the default.
        rate: u32,
    },
}

impl TryFrom<&CommandMessage> for Command {
    type Error = Error;

    fn try_from(message: &CommandMessage) -> Result<Self, Self::Error> {
        let port = || {
            message
                .port
                .ok_or_else(|| Error::BadCommand(format!("`{}` needs a port", message.command)))
        };
        let location = || match message.location.as_deref() {
            Some(location) if !location.is_empty() => Ok(Location::new(location)),
            _ => Err(Error::BadCommand(format!(
                "`{}` needs a location",
                message.command
            ))),
        };

        Ok(match message.command.as_str() {
            "restart" => Command::Restart(Target::Port(port()?)),
            "restart_id" => Command::Restart(Target::Location(location()?)),
            "reattach" => Command::Reattach(Target::Port(port()?)),
            "reattach_id" => Command::Reattach(Target::Location(location()?)),
            "set_baudrate" => Command::SetBaudRate {
                port: port()?,
                rate: message.value.ok_or_else(|| {
                    Error::BadCommand("`set_baudrate` needs a value".into())
                })?,
            },
            other => return Err(Error::BadCommand(format!("Unknown command `{other}`"))),
        })
    }
}

/// What a successful command did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// The forwarder was reopened.
    Restarted {
        /// Its location.
        location: Location,

        /// Its port.
        port: u16,
    },

    /// The driver was rebound.
    Reattached {
        /// The device location.
        location: Location,
    },

    /// The forwarder was reopened at a new rate.
    BaudRateSet {
        /// Its port.
        port: u16,

        /// The rate now in effect.
        rate: u32,
    },
}

impl CommandOutcome {
    /// An example outcome, for documentation.
    pub fn example() -> Self {
        Self::BaudRateSet {
            port: 7001,
            rate: 9600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> Result<Command, Error> {
        let message: CommandMessage = serde_json::from_str(json).unwrap();
        Command::try_from(&message)
    }

    #[test]
    fn well_formed() {
        assert_eq!(
            parse(r#"{"command": "restart", "port": 7000}"#),
            Ok(Command::Restart(Target::Port(7000)))
        );
        assert_eq!(
            parse(r#"{"command": "reattach_id", "location": "1-1.2:1.0"}"#),
            Ok(Command::Reattach(Target::Location(Location::new("1-1.2:1.0"))))
        );
        assert_eq!(
            parse(r#"{"command": "set_baudrate", "port": 7001, "value": 9600}"#),
            Ok(Command::SetBaudRate {
                port: 7001,
                rate: 9600
            })
        );
    }

    #[test]
    fn malformed() {
        for json in [
            r#"{"command": "explode", "port": 7000}"#,
            r#"{"command": "restart"}"#,
            r#"{"command": "restart_id", "location": ""}"#,
            r#"{"command": "set_baudrate", "port": 7000}"#,
        ] {
            assert!(matches!(parse(json), Err(Error::BadCommand(_))), "{json}");
        }
    }

    #[test]
    fn constructors_match_the_wire_format() {
        assert_eq!(
            serde_json::to_string(&CommandMessage::set_baudrate(7001, 9600)).unwrap(),
            r#"{"command":"set_baudrate","port":7001,"value":9600}"#
        );
        assert_eq!(
            serde_json::to_string(&CommandMessage::restart_id("1-2")).unwrap(),
            r#"{"command":"restart_id","location":"1-2"}"#
        );
    }
}
