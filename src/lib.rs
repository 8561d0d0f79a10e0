#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Stable identifiers of attached devices.
pub mod device;

/// Port to baud rate overrides.
pub mod baud;

/// Location to port assignments.
pub mod ports;

/// On-disk key-value tables.
pub mod persistence;

/// Serial devices and their line control.
pub mod serial;

pub mod rfc2217;

pub mod forwarder;

pub mod discovery;

pub mod announce;

pub mod commands;

pub mod gateway;

/// The HTTP control channel.
pub mod server;

/// The configuration file.
pub mod config;

/// Command line interface.
pub mod cli;

/// Logging setup.
pub mod logging;

/// Possible errors in this library.
pub mod error;

pub mod mock;
