use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eidetic::Engine;
use eidetic::config::Config;
use eidetic_cli::commands::{
    ConfigCommand, ConsolidateCommand, PatternsCommand, RecallCommand, StatsCommand, StoreCommand,
};
use eidetic_cli::error::CliResult;
use eidetic_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "eidetic-cli")]
#[command(about = "Eidetic CLI - Management tool for the eidetic memory engine")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Show record, category and weight statistics")]
    Stats(StatsCommand),

    #[clap(about = "Store a record")]
    Store(StoreCommand),

    #[clap(about = "Recall records matching a query")]
    Recall(RecallCommand),

    #[clap(about = "Run a consolidation cycle now")]
    Consolidate(ConsolidateCommand),

    #[clap(about = "Find clusters of related records")]
    Patterns(PatternsCommand),

    #[clap(about = "Configuration commands")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    if let Command::Config(cmd) = &cli.command {
        return cmd.execute(&config, format);
    }

    let engine = Engine::from_config(config).await?;
    match &cli.command {
        Command::Stats(cmd) => cmd.execute(&engine, format).await,
        Command::Store(cmd) => cmd.execute(&engine, format).await,
        Command::Recall(cmd) => cmd.execute(&engine, format).await,
        Command::Consolidate(cmd) => cmd.execute(&engine, format).await,
        Command::Patterns(cmd) => cmd.execute(&engine, format).await,
        Command::Config(cmd) => cmd.execute(engine.config(), format),
    }
}
