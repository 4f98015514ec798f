//! Eidetic Daemon - weight-based memory engine behind an HTTP API

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use eidetic::api::ApiServer;
use eidetic::config::Config;
use eidetic::engine::Engine;
use eidetic::error::Result;
use eidetic::memory::ConsolidationScheduler;

/// Eidetic - memories are never deleted, only fade
#[derive(Parser)]
#[command(name = "eidetic")]
#[command(about = "Weight-based memory engine with hybrid recall")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the API server and consolidation cycles (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,eidetic=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Eidetic daemon");

    let config = Config::load(config_path.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);
    tracing::info!("Initializing storage at: {}", config.storage.data_dir.display());

    let scheduler_enabled = config.consolidation.enabled;
    let engine = Arc::new(Engine::from_config(config).await?);

    let scheduler = if scheduler_enabled {
        Some(ConsolidationScheduler::spawn(Arc::clone(&engine)))
    } else {
        tracing::info!("Consolidation scheduler disabled");
        None
    };

    ApiServer::new(Arc::clone(&engine)).serve().await?;

    // Serving returns after shutdown was signalled; let the cycles wind down
    engine.shutdown();
    if let Some(scheduler) = scheduler {
        scheduler.join().await;
    }

    tracing::info!("Eidetic daemon stopped");
    Ok(())
}
