use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

mod cli;
mod config_cmds;
mod logging;
mod queue_cmds;
mod worker;

use cli::{Cli, Commands, ConfigCommands};
use genrelay_config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the file writer alive until exit so buffered lines are flushed.
    let _log_guard = logging::init(cli.log_dir.as_deref())?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Init { force } => config_cmds::handle_config_init(config_path, force)?,
            ConfigCommands::Show => config_cmds::handle_config_show(config_path)?,
            ConfigCommands::Validate => config_cmds::handle_config_validate(config_path)?,
        },
        Commands::Policies => {
            let config = Config::load(config_path)?;
            queue_cmds::handle_policies(&config);
        }
        Commands::Slots { key, window } => {
            let config = Config::load(config_path)?;
            queue_cmds::handle_slots(&config, &key, window).await?;
        }
        Commands::Enqueue { file, delay } => {
            let config = Config::load(config_path)?;
            queue_cmds::handle_enqueue(&config, &file, delay).await?;
        }
        Commands::Worker => {
            let config = Config::load(config_path)?;
            let (queue, scheduler) = worker::build(&config).await?;
            let settings = worker::WorkerSettings::from(&config.queue);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            worker::run(queue, Arc::new(scheduler), settings, shutdown).await?;
        }
    }
    Ok(())
}
