//! Bus server command.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use pollbus_core::{BusConfig, Dispatcher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value = "3030", env = "POLLBUS_PORT")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "POLLBUS_HOST")]
    pub host: String,

    /// Default long-poll timeout in seconds
    #[arg(long)]
    pub poll_timeout: Option<u64>,

    /// Per-consumer backlog bound
    #[arg(long)]
    pub max_backlog: Option<usize>,

    /// Also write logs to this file
    #[arg(long)]
    pub log: Option<PathBuf>,
}

impl ServeArgs {
    fn apply(&self, config: &mut BusConfig) {
        if let Some(secs) = self.poll_timeout {
            config.poll_timeout_secs = secs;
        }
        if let Some(limit) = self.max_backlog {
            config.max_backlog = limit;
        }
    }
}

pub async fn execute(args: ServeArgs, mut config: BusConfig) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;

    println!();
    println!("  {} {}", "Pollbus".cyan().bold(), "Notification Bus".bold());
    println!();
    println!("  {}      http://{}/longpolling/send", "Send".green(), addr);
    println!("  {}      http://{}/longpolling/poll", "Poll".green(), addr);
    println!("  {} ws://{}/websocket", "WebSocket".green(), addr);
    println!("  {}    http://{}/health", "Health".green(), addr);
    println!();
    println!(
        "  {}",
        format!(
            "poll timeout {}s, backlog {}, keeps {}..{} entries",
            config.poll_timeout_secs,
            config.max_backlog,
            config.retention.min_retained,
            config.retention.max_retained
        )
        .dimmed()
    );
    println!("  {}", "Ctrl+C to stop".dimmed());
    println!();

    let bus = Arc::new(Dispatcher::new(config));
    pollbus_web::run_server(bus, addr).await?;

    Ok(())
}
