use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "genrelay")]
#[command(about = "Rate-limited generation job worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to $GENRELAY_CONFIG, then ~/.config/genrelay/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the activation worker until Ctrl-C
    Worker,

    /// Submit a generate activation from a JSON job descriptor
    Enqueue {
        /// Path to the descriptor JSON
        file: PathBuf,

        /// Seconds before the activation becomes ready
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },

    /// Print the policy table with resolved admission keys
    Policies,

    /// Show holder count and rate-window size for an admission key
    Slots {
        key: String,

        /// Rate window in seconds (defaults to the window of a policy using this key)
        #[arg(long)]
        window: Option<u64>,
    },

    /// Show/manage configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a commented config template
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Validate configuration file
    Validate,
}
