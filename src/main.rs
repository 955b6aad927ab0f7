//! # pika
//!
//! PIKA server binary: loads configuration, installs logging and serves the
//! session transport until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pika_core::executor::ActionRegistry;
use pika_core::planner::NoopPlanner;
use pika_server::config::{self, ServerConfig};
use pika_telemetry::{init_telemetry, LogFormat};

/// PIKA real-time session server.
#[derive(Parser, Debug)]
#[command(name = "pika", about = "PIKA real-time session server")]
struct Cli {
    /// Settings file (defaults to `~/.pika/settings.json` if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (json or pretty).
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Disable idle nudges.
    #[arg(long)]
    no_nudge: bool,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = self.log_level {
            config.telemetry.level = level;
        }
        if let Some(format) = self.log_format {
            config.telemetry.format = format;
        }
        if self.no_nudge {
            config.nudge.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref()).context("Failed to load settings")?;
    cli.apply(&mut config);

    let _telemetry = init_telemetry(config.telemetry.telemetry_config());

    let executor = Arc::new(ActionRegistry::with_builtins());
    tracing::info!(actions = ?executor.kinds(), "action handlers registered");

    let handle = pika_server::start(&config, Arc::new(NoopPlanner), executor)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "PIKA server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");
    handle.shutdown().await;

    Ok(())
}
