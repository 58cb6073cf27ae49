//! `flockd`: the flock daemon.
//!
//! Runs process groups in-process on the memory transport and prints what
//! each member observes.
//!
//! # Usage
//!
//! ```text
//! flockd simulate                      # three members, flush enabled
//! flockd simulate -n 5 --no-flush      # five members, no flush
//! flockd -c flock.toml simulate        # settings from a config file
//! flockd show-config                   # print the effective configuration
//! ```

mod config;
mod simulation;
mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "flockd", version, about = "flock process group daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "FLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the group name.
    #[arg(short, long, global = true, env = "FLOCK_GROUP")]
    group: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process group through joins, RPC, partitions and crashes.
    Simulate {
        /// Number of members to start.
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Disable flush around view changes.
        #[arg(long)]
        no_flush: bool,
    },

    /// Print the effective configuration.
    ShowConfig,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    // CLI args override config file values.
    if let Some(group) = cli.group {
        config.group.group_name = group;
    }

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Simulate { nodes, no_flush } => {
            if let Some(n) = nodes {
                config.simulation.nodes = n;
            }
            if no_flush {
                config.simulation.flush = false;
            }
            config.validate().context("invalid configuration")?;
            info!(
                group = %config.group.group_name,
                nodes = config.simulation.nodes,
                flush = config.simulation.flush,
                "starting simulation"
            );
            simulation::run(&config).await
        }
        Commands::ShowConfig => {
            config.validate().context("invalid configuration")?;
            println!("{config:#?}");
            Ok(())
        }
    }
}
