//! Tether Agent Binary
//!
//! Loads configuration, connects to the control server and executes
//! commands until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tether_agent::config::LogFormat;
use tether_agent::{logging, AgentConfig, ConfigOverrides, ConnectionManager, WsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Remote command execution agent
#[derive(Debug, Parser)]
#[command(name = "tether-agent", version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Control server URL, overrides the config file
    #[arg(long, env = "TETHER_SERVER_URL")]
    server_url: Option<String>,

    /// Agent token, overrides the config file
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

fn load_config(cli: Cli) -> Result<AgentConfig> {
    let mut config = if cli.config.exists() {
        AgentConfig::load_from(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        // Everything may come from flags and environment.
        AgentConfig::new("", "")
    };

    config.apply(ConfigOverrides {
        server_url: cli.server_url,
        token: cli.token,
        log_level: cli.log_level,
        log_format: cli.log_format.map(LogFormat::from),
    });
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Interrupt received, shutting down");
    shutdown.cancel();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tether-agent: {:#}", e);
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    let mut manager = ConnectionManager::new(config.clone(), WsConnector);
    let identity = manager.identity();
    println!("Tether Agent v{}", identity.version);
    println!("  Device:   {}", identity.device_name);
    println!("  Platform: {}", identity.platform);
    println!("  Server:   {}", config.server.url);

    tokio::spawn(wait_for_signal(manager.shutdown_token()));

    if let Err(e) = manager.run().await {
        error!("Agent stopped: {}", e);
        std::process::exit(1);
    }

    info!("Agent shut down");
}
