//! CLI command handling
//!
//! Dispatches CLI commands to the registry, the cleaner and the scenario
//! loader, and formats their output.

use std::sync::Arc;

use colored::Colorize;

use crate::commands::{Commands, InstanceCommands};
use crate::common::config::Config;
use crate::common::Result;
use crate::infra::{
    Cleaner, CleanupOptions, CleanupReport, InstanceRegistry, InstanceStatus, PortSet,
    SystemCommandRunner,
};
use crate::scenario::{load_scenarios, Scenario};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config: &Config) -> Result<()> {
    let registry = InstanceRegistry::from_config(&config.instances);

    match command {
        Commands::Ports { id, json } => {
            let ports = registry.ports(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ports)?);
            } else {
                print_ports(id, &ports);
            }
            Ok(())
        }

        Commands::Instances(cmd) => match cmd {
            InstanceCommands::List { json } => {
                let instances = registry.list()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&instances)?);
                } else {
                    print_instances(&instances, registry.available_count()?, registry.max_instances());
                }
                Ok(())
            }

            InstanceCommands::Acquire => {
                let record = registry.acquire()?;
                println!("{} Acquired instance {}", "✓".green(), record.id);
                print_ports(i64::from(record.id), &record.ports);
                Ok(())
            }

            InstanceCommands::Release { id } => {
                if registry.release(id)? {
                    println!("{} Released instance {}", "✓".green(), id);
                } else {
                    println!("Instance {} was not registered", id);
                }
                Ok(())
            }

            InstanceCommands::CleanStale => {
                let cleaned = registry.clean_stale()?;
                if cleaned.is_empty() {
                    println!("No stale instances");
                } else {
                    let ids: Vec<String> = cleaned.iter().map(|id| id.to_string()).collect();
                    println!("{} Removed stale instances: {}", "✓".green(), ids.join(", "));
                }
                Ok(())
            }
        },

        Commands::Cleanup {
            instance,
            dry_run,
            json,
        } => {
            let cleaner = Cleaner::new(Arc::new(SystemCommandRunner), Arc::new(registry));
            let options = CleanupOptions { dry_run };
            let report = match instance {
                Some(id) => cleaner.cleanup_instance(id, options).await?,
                None => cleaner.cleanup_all(options).await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_cleanup(&report);
            }
            Ok(())
        }

        Commands::Check { files } => {
            let scenarios = load_scenarios(&files)?;
            for scenario in &scenarios {
                print_scenario(scenario);
            }
            println!(
                "\n{} {} scenario(s) loaded",
                "✓".green().bold(),
                scenarios.len()
            );
            Ok(())
        }
    }
}

fn print_ports(id: i64, ports: &PortSet) {
    println!("Instance {}:", id.to_string().bold());
    println!("  db:           {}", ports.db);
    println!("  api:          {}", ports.api);
    println!("  vector store: {}", ports.vector_store);
    println!("  tunnel:       {}", ports.tunnel);
}

fn print_instances(instances: &[InstanceStatus], available: u32, max: u32) {
    if instances.is_empty() {
        println!("No instances registered");
    } else {
        println!("Instances:");
        for status in instances {
            let record = &status.record;
            let state = if status.stale {
                "stale".yellow()
            } else {
                "active".green()
            };
            println!(
                "  #{} [{}] pid {} since {} (db {}, api {})",
                record.id,
                state,
                record.owner_pid,
                record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                record.ports.db,
                record.ports.api
            );
        }
    }
    println!("{} of {} slots available", available, max);
}

fn print_cleanup(report: &CleanupReport) {
    let verb = if report.dry_run { "Would remove" } else { "Removed" };
    for resource in &report.resources {
        println!("  {} {} {}", "-".dimmed(), resource.kind, resource.name);
    }

    let counts = [
        ("sessions", report.sessions_killed),
        ("processes", report.processes_killed),
        ("compose projects", report.compose_projects_removed),
        ("containers", report.containers_removed),
        ("state dirs", report.state_dirs_removed),
        ("registry entries", report.registry_entries_cleared),
    ];
    let summary: Vec<String> = counts
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(what, n)| format!("{} {}", n, what))
        .collect();

    if summary.is_empty() {
        println!("Nothing to clean up");
    } else {
        println!("{} {}: {}", "✓".green(), verb, summary.join(", "));
    }

    for error in &report.errors {
        println!("  {} {}", "✗".red(), error);
    }
}

fn print_scenario(scenario: &Scenario) {
    println!("{} {}", scenario.id.bold(), scenario.display_name().dimmed());
    if !scenario.setup.is_empty() {
        println!("  setup: {} insert(s)", scenario.setup.len());
    }
    for (i, step) in scenario.steps.iter().enumerate() {
        match step.label() {
            Some(label) => println!("  {}. {} {}", i + 1, step.kind(), label),
            None => println!("  {}. {}", i + 1, step.kind()),
        }
    }
}
