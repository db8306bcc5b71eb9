//! Mirage Mocker - Main Application
//!
//! Serves mock responses and passes requests through to upstream services.

use clap::Parser;
use mirage_mocker::{
    config::AppConfig, dispatcher::Dispatcher, hooks::HookRegistry, logging,
    server::start_server,
};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "mocker.yml";

/// Mirage Mocker - mock and pass-through HTTP intermediary
#[derive(Parser)]
#[command(name = "mirage-mocker")]
#[command(about = "Stand in for backend services with mocked or forwarded responses")]
#[command(version)]
struct Cli {
    /// Configuration file path (MIRAGE_MOCKER_CONFIG takes precedence)
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    std::env::var_os("MIRAGE_MOCKER_CONFIG")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or(arg)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);

    // Load configuration
    let mut config = AppConfig::load(&config_path)
        .map_err(|e| e.context(format!("error loading config {}", config_path.display())))?;

    // Override with CLI args
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    logging::init(config.server.pretty_logs, cli.verbose)?;
    tracing::info!(path = %config_path.display(), "using config file");
    tracing::debug!(config = ?config, "config content");

    let hooks = HookRegistry::new();
    let dispatcher = Dispatcher::from_config(&config, &hooks)
        .map_err(|e| anyhow::anyhow!(e).context("error creating processor"))?;

    if cli.validate {
        println!(
            "Configuration is valid ({} services defined)",
            dispatcher.routes().len()
        );
        return Ok(());
    }

    start_server(&config.server, Arc::new(dispatcher)).await?;

    Ok(())
}
