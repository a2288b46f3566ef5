use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypoint_core::config::EngineConfig;

mod commands;
mod demo;

use commands::{config as config_cmd, run};

/// Command-line driver for the Waypoint execution engine
#[derive(Parser)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to an engine configuration file (TOML)
    #[arg(long, env = "WAYPOINT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Output in CSV format
    #[arg(long)]
    pub csv: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a demonstration plan over synthetic data
    Run(run::RunArgs),
    /// Engine configuration
    Config(config_cmd::ConfigArgs),
}

fn init_logging(verbose: bool, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            "waypoint=debug,waypoint_core=debug".into()
        } else {
            "waypoint=info,waypoint_core=info".into()
        }
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let output = commands::OutputContext {
        json: cli.json,
        csv: cli.csv,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => {
            let cfg = EngineConfig::load(cli.config.as_deref())?;
            run::execute(args, cfg, &output)
        }
        Commands::Config(args) => config_cmd::execute(args, cli.config.as_deref(), &output),
    }
}
