//! Resource discovery from OS enumeration
//!
//! Resources are found by asking their owning tool and filtering on the
//! naming prefix, never by reading the registry. That keeps cleanup correct
//! after a crash that skipped normal teardown.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::common::config::InstanceConfig;
use crate::common::paths::validate_name;
use crate::common::{Error, Result};

use super::instance::instance_prefix;
use super::process::{own_process_chain, CommandOutput, CommandRunner};

/// Which resources an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everything carrying the current or legacy prefix
    Global,
    /// Only resources of one instance
    Instance(u32),
}

/// Kinds of OS-level resources, in teardown order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredKind {
    Session,
    Process,
    ComposeProject,
    Container,
    StateDir,
}

impl fmt::Display for DiscoveredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoveredKind::Session => "session",
            DiscoveredKind::Process => "process",
            DiscoveredKind::ComposeProject => "compose project",
            DiscoveredKind::Container => "container",
            DiscoveredKind::StateDir => "state dir",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredResource {
    pub kind: DiscoveredKind,
    pub name: String,
    /// Set for processes
    pub pid: Option<u32>,
    /// Set for state directories
    pub path: Option<PathBuf>,
}

impl DiscoveredResource {
    fn named(kind: DiscoveredKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            pid: None,
            path: None,
        }
    }
}

/// Enumerates prefixed resources through a [`CommandRunner`]
#[derive(Clone)]
pub struct Discovery {
    runner: Arc<dyn CommandRunner>,
    config: InstanceConfig,
}

impl Discovery {
    pub fn new(runner: Arc<dyn CommandRunner>, config: InstanceConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Name prefixes that select resources in `scope`
    pub fn prefixes(&self, scope: Scope) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        match scope {
            Scope::Global => {
                prefixes.push(format!("{}-", validate_name(&self.config.prefix)?));
                if let Some(legacy) = &self.config.legacy_prefix {
                    prefixes.push(format!("{}-", validate_name(legacy)?));
                }
            }
            Scope::Instance(id) => {
                if id >= self.config.max_instances {
                    return Err(Error::InstanceOutOfRange {
                        id: i64::from(id),
                        max: self.config.max_instances,
                    });
                }
                prefixes.push(instance_prefix(&self.config.prefix, id)?);
                if let Some(legacy) = &self.config.legacy_prefix {
                    prefixes.push(instance_prefix(legacy, id)?);
                }
            }
        }
        Ok(prefixes)
    }

    fn matches(prefixes: &[String], name: &str) -> bool {
        prefixes.iter().any(|p| name.starts_with(p.as_str())) && validate_name(name).is_ok()
    }

    /// Run a listing command, treating "nothing there" exits as empty output
    async fn list(
        &self,
        program: &str,
        args: &[&str],
        empty_exit: Option<i32>,
        empty_stderr: &[&str],
    ) -> Result<Option<CommandOutput>> {
        if !self.runner.is_available(program) {
            return Err(Error::ToolUnavailable(program.to_string()));
        }
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run(program, &args).await?;
        if output.success() {
            return Ok(Some(output));
        }
        let benign_exit = empty_exit.is_some() && output.status == empty_exit;
        let benign_stderr = empty_stderr
            .iter()
            .any(|needle| output.stderr.to_lowercase().contains(needle));
        if benign_exit || benign_stderr {
            return Ok(None);
        }
        Err(Error::command_failed(program, &args, &output.stderr))
    }

    /// Terminal multiplexer sessions
    pub async fn sessions(&self, scope: Scope) -> Result<Vec<DiscoveredResource>> {
        let prefixes = self.prefixes(scope)?;
        let output = self
            .list(
                "tmux",
                &["list-sessions", "-F", "#{session_name}"],
                None,
                &["no server running", "no sessions", "error connecting"],
            )
            .await?;
        Ok(output
            .iter()
            .flat_map(|o| o.lines())
            .filter(|name| Self::matches(&prefixes, name))
            .map(|name| DiscoveredResource::named(DiscoveredKind::Session, name))
            .collect())
    }

    /// Processes with a prefixed resource name among their arguments
    ///
    /// `pgrep` only narrows the search; a process is kept when one whole
    /// command-line word is a valid name starting with a prefix. This process, its
    /// ancestors and tmux itself are never returned.
    pub async fn processes(&self, scope: Scope) -> Result<Vec<DiscoveredResource>> {
        let prefixes = self.prefixes(scope)?;
        let protected = own_process_chain();
        let mut found: Vec<DiscoveredResource> = Vec::new();

        for prefix in &prefixes {
            // pgrep exits 1 when nothing matches
            let Some(output) = self.list("pgrep", &["-af", prefix.as_str()], Some(1), &[]).await? else {
                continue;
            };
            for line in output.lines() {
                let Some((pid, command)) = line.split_once(char::is_whitespace) else {
                    continue;
                };
                let Ok(pid) = pid.parse::<u32>() else {
                    continue;
                };
                if protected.contains(&pid) || found.iter().any(|r| r.pid == Some(pid)) {
                    continue;
                }
                let command = command.trim();
                let program = command.split_whitespace().next().unwrap_or_default();
                // pgrep sees its own pattern; the tmux server is handled as sessions
                if is_excluded_program(program) {
                    continue;
                }
                if !command
                    .split_whitespace()
                    .any(|arg| Self::matches(&prefixes, arg))
                {
                    continue;
                }
                found.push(DiscoveredResource {
                    kind: DiscoveredKind::Process,
                    name: command.to_string(),
                    pid: Some(pid),
                    path: None,
                });
            }
        }
        Ok(found)
    }

    /// Docker compose projects
    pub async fn compose_projects(&self, scope: Scope) -> Result<Vec<DiscoveredResource>> {
        let prefixes = self.prefixes(scope)?;
        let Some(output) = self
            .list("docker", &["compose", "ls", "-a", "--format", "json"], None, &[])
            .await?
        else {
            return Ok(Vec::new());
        };

        let trimmed = output.stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let projects: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
        Ok(projects
            .iter()
            .filter_map(|p| p.get("Name").and_then(|n| n.as_str()))
            .filter(|name| Self::matches(&prefixes, name))
            .map(|name| DiscoveredResource::named(DiscoveredKind::ComposeProject, name))
            .collect())
    }

    /// Docker containers, running or not
    pub async fn containers(&self, scope: Scope) -> Result<Vec<DiscoveredResource>> {
        let prefixes = self.prefixes(scope)?;
        let output = self
            .list("docker", &["ps", "-a", "--format", "{{.Names}}"], None, &[])
            .await?;
        Ok(output
            .iter()
            .flat_map(|o| o.lines())
            .filter(|name| Self::matches(&prefixes, name))
            .map(|name| DiscoveredResource::named(DiscoveredKind::Container, name))
            .collect())
    }

    /// Per-instance directories under the state dir
    pub fn state_dirs(&self, scope: Scope) -> Result<Vec<DiscoveredResource>> {
        let prefixes = self.prefixes(scope)?;
        let base = self.config.state_dir();
        let entries = match std::fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::matches(&prefixes, &name) {
                found.push(DiscoveredResource {
                    kind: DiscoveredKind::StateDir,
                    name,
                    pid: None,
                    path: Some(entry.path()),
                });
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

fn is_excluded_program(program: &str) -> bool {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
        .trim_end_matches(':');
    matches!(name, "pgrep" | "tmux")
}
