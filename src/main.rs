//! agent-eval - scenario runner for AI agents
//!
//! The CLI exposes the environment side of the runner: instance ports, the
//! instance registry, resource cleanup and scenario file checks.

use std::path::PathBuf;

use agent_eval::commands::Commands;
use agent_eval::common::config::Config;
use agent_eval::common::logging;
use agent_eval::{cli, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "agent-eval", about = "Scenario runner for AI agents")]
#[command(version, long_about = None)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    let result = match load_config(cli.config.as_ref()) {
        Ok(config) => cli::dispatch(cli.command, &config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
