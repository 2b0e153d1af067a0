//! CLI command definitions and handlers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use pollbus_core::BusConfig;
use std::path::PathBuf;

pub mod config;
pub mod serve;

/// Pollbus - channel notification bus over long-polling and WebSocket
#[derive(Parser)]
#[command(name = "pollbus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "POLLBUS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bus server
    Serve(serve::ServeArgs),

    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = BusConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Serve(args) => serve::execute(args, config).await,
            Commands::Config => config::execute(&config),
        }
    }
}
