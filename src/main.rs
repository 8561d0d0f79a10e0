use clap::Parser;
use color_eyre::Result;
use serial_dock::{
    cli,
    config::Config,
    gateway::{Collaborators, GatewayHandle},
    logging, server,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(cli.log_level, cli.log_dir.clone().map(|dir| (Level::DEBUG, dir))).await;

    let config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };
    let config = cli.apply(config);
    config.validate()?;

    let gateway = GatewayHandle::new(config.clone(), Collaborators::system(&config)?);

    let control = {
        let config = config.clone();
        let gateway = gateway.clone();

        async move {
            if config.control_enabled {
                server::run(config, gateway).await
            } else {
                info!("Control channel disabled");
                futures::future::pending().await
            }
        }
    };

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            Ok(())
        }
        _ = hangup.recv() => {
            info!("Told to hang up, quitting");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("Terminated, quitting");
            Ok(())
        }
        result = control => {
            error!(?result, "Control channel returned");
            Err(color_eyre::eyre::eyre!("Control channel stopped unexpectedly"))
        }
    };

    gateway.shutdown().await;
    logging::shutdown();

    outcome
}
