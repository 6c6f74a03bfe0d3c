//! CLI command definitions
//!
//! Defines the clap commands for the agent-eval CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Show the ports reserved for an instance
    Ports {
        /// Instance id
        #[arg(allow_negative_numbers = true)]
        id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Instance registry management
    #[command(subcommand)]
    Instances(InstanceCommands),

    /// Remove containers, sessions, processes and state left by test instances
    Cleanup {
        /// Only clean up this instance
        #[arg(long, short)]
        instance: Option<i64>,

        /// Show what would be removed without removing anything
        #[arg(long)]
        dry_run: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load scenario files and summarize them
    Check {
        /// Scenario YAML files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// List registered instances
    #[command(alias = "ls")]
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Claim the lowest free instance slot
    Acquire,

    /// Release an instance slot
    Release {
        /// Instance id
        id: i64,
    },

    /// Drop registry entries whose owner is gone or too old
    CleanStale,
}
