//! DrawGuard service binary
//!
//! Opens the draw store, starts the background queue processor and integrity
//! checks, then serves the HTTP API until shutdown.

use clap::Parser;
use drawguard::{
    api::ApiServer,
    config::{ConfigLoader, DrawGuardConfig, LoggingConfig},
    errors::DrawGuardResult,
    services::ServiceContainer,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// DrawGuard CLI
#[derive(Parser)]
#[command(name = "drawguard")]
#[command(about = "Draw ingestion, sequence integrity and analytics service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> DrawGuardResult<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    apply_cli_overrides(&mut config, &cli);
    loader.validate(&config)?;

    if cli.print_config {
        match toml::to_string_pretty(&config) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render configuration: {}", e),
        }
        return Ok(());
    }

    init_tracing(&config.logging);

    info!("🚀 Starting DrawGuard v{}", env!("CARGO_PKG_VERSION"));

    let services = Arc::new(ServiceContainer::new(config.clone())?);
    let background = services.start_background();

    let server = ApiServer::new(config.api.clone(), services.clone());
    if let Err(e) = server.run().await {
        error!(error = %e, "API server failed");
    }

    background.shutdown().await;
    info!("👋 DrawGuard stopped");
    Ok(())
}

fn apply_cli_overrides(config: &mut DrawGuardConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.api.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_directory = dir.clone();
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
