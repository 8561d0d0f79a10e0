use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    announce::AnnounceMode,
    commands::{CommandMessage, CommandOutcome},
    config::Config,
    error::Error,
};

/// The command line interface for serial dock.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Lowest TCP port handed out
    #[arg(long)]
    pub base_port: Option<u16>,

    /// Address forwarders listen on
    #[arg(long)]
    pub bind_address: Option<IpAddr>,

    /// Regular expression selecting device paths
    #[arg(long)]
    pub device_pattern: Option<String>,

    /// File remembering port assignments
    #[arg(long)]
    pub port_map: Option<PathBuf>,

    /// File remembering baud rate overrides
    #[arg(long)]
    pub baud_map: Option<PathBuf>,

    /// Baud rate for ports without an override
    #[arg(long)]
    pub default_baud_rate: Option<u32>,

    /// Seconds between device scans
    #[arg(long)]
    pub discovery_interval: Option<u64>,

    /// Seconds between purges of entries for absent devices
    #[arg(long)]
    pub cleanup_interval: Option<u64>,

    /// Address of the control channel
    #[arg(long)]
    pub control_address: Option<SocketAddr>,

    /// Do not run the control channel
    #[arg(long)]
    pub no_control: bool,

    /// How forwarded ports are advertised
    #[arg(long, value_enum)]
    pub announce: Option<AnnounceMode>,

    /// Host name to advertise
    #[arg(long)]
    pub announce_host: Option<String>,

    /// Where sysfs is mounted
    #[arg(long)]
    pub sysfs_root: Option<PathBuf>,

    /// Log level for stdout
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply command line overrides on top of a configuration.
    pub fn apply(&self, mut config: Config) -> Config {
        macro_rules! set {
            ($field:ident, $arg:expr) => {
                if let Some(value) = $arg.clone() {
                    config.$field = value;
                }
            };
        }

        set!(base_port, self.base_port);
        set!(bind_address, self.bind_address);
        set!(device_pattern, self.device_pattern);
        set!(port_map, self.port_map);
        set!(baud_map, self.baud_map);
        set!(default_baud_rate, self.default_baud_rate);
        set!(discovery_interval_secs, self.discovery_interval);
        set!(control_address, self.control_address);
        set!(announce, self.announce);
        set!(sysfs_root, self.sysfs_root);

        if let Some(cleanup) = self.cleanup_interval {
            config.cleanup_interval_secs = Some(cleanup);
        }
        if let Some(host) = &self.announce_host {
            config.announce_host = Some(host.clone());
        }
        if self.no_control {
            config.control_enabled = false;
        }

        config
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON control command and its response.
    Command,
}

/// Print the requested example.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty());
        }
        Commands::Examples(Examples::Command) => {
            let request = CommandMessage::set_baudrate(7001, 9600);
            let response: Result<CommandOutcome, Error> = Ok(CommandOutcome::example());

            for example in [
                serde_json::to_string_pretty(&request),
                serde_json::to_string_pretty(&response),
            ] {
                match example {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("Could not serialize example: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_win() {
        let cli = Cli::parse_from([
            "serial-dock",
            "--base-port",
            "9000",
            "--no-control",
            "--announce",
            "off",
            "--cleanup-interval",
            "60",
        ]);

        let config = cli.apply(Config::default());

        assert_eq!(config.base_port, 9000);
        assert!(!config.control_enabled);
        assert_eq!(config.announce, AnnounceMode::Off);
        assert_eq!(config.cleanup_interval_secs, Some(60));
        assert_eq!(config.default_baud_rate, 115_200);
    }
}
