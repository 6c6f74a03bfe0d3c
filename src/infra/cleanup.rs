//! Discovery-driven teardown of instance resources
//!
//! Teardown order: sessions and stray processes (they hold ports), compose
//! projects, containers, state directories, then registry bookkeeping. A
//! failure on one resource is recorded and the rest still get cleaned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::common::paths::validate_name;
use crate::common::{Error, Result};

use super::discovery::{DiscoveredKind, DiscoveredResource, Discovery, Scope};
use super::process::{CommandRunner, ProcessLiveness, SystemLiveness};
use super::registry::InstanceRegistry;

/// Tools cleanup needs before it touches anything
const REQUIRED_TOOLS: [&str; 3] = ["tmux", "pgrep", "docker"];

/// How long a signalled process gets to exit, per signal
const EXIT_GRACE: Duration = Duration::from_secs(3);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Discover and count, but run nothing destructive
    pub dry_run: bool,
}

/// What a cleanup pass removed (or would remove, for a dry run)
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub sessions_killed: usize,
    pub processes_killed: usize,
    pub compose_projects_removed: usize,
    pub containers_removed: usize,
    pub state_dirs_removed: usize,
    pub registry_entries_cleared: usize,
    /// Resources acted on, in teardown order
    pub resources: Vec<DiscoveredResource>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.sessions_killed
            + self.processes_killed
            + self.compose_projects_removed
            + self.containers_removed
            + self.state_dirs_removed
            + self.registry_entries_cleared
    }

    fn count(&mut self, resource: DiscoveredResource) {
        match resource.kind {
            DiscoveredKind::Session => self.sessions_killed += 1,
            DiscoveredKind::Process => self.processes_killed += 1,
            DiscoveredKind::ComposeProject => self.compose_projects_removed += 1,
            DiscoveredKind::Container => self.containers_removed += 1,
            DiscoveredKind::StateDir => self.state_dirs_removed += 1,
        }
        self.resources.push(resource);
    }
}

pub struct Cleaner {
    runner: Arc<dyn CommandRunner>,
    liveness: Arc<dyn ProcessLiveness>,
    exit_grace: Duration,
    discovery: Discovery,
    registry: Arc<InstanceRegistry>,
}

impl Cleaner {
    pub fn new(runner: Arc<dyn CommandRunner>, registry: Arc<InstanceRegistry>) -> Self {
        let discovery = Discovery::new(runner.clone(), registry.config().clone());
        Self {
            runner,
            liveness: Arc::new(SystemLiveness),
            exit_grace: EXIT_GRACE,
            discovery,
            registry,
        }
    }

    /// Liveness check used to confirm killed processes are gone
    pub fn with_liveness(mut self, liveness: Arc<dyn ProcessLiveness>) -> Self {
        self.liveness = liveness;
        self
    }

    /// Time a process gets to exit after each signal
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Remove everything carrying the current or legacy prefix
    pub async fn cleanup_all(&self, options: CleanupOptions) -> Result<CleanupReport> {
        self.cleanup(Scope::Global, options).await
    }

    /// Remove the resources of one instance
    pub async fn cleanup_instance(&self, id: i64, options: CleanupOptions) -> Result<CleanupReport> {
        let max = self.registry.max_instances();
        if id < 0 || id >= i64::from(max) {
            return Err(Error::InstanceOutOfRange { id, max });
        }
        self.cleanup(Scope::Instance(id as u32), options).await
    }

    async fn cleanup(&self, scope: Scope, options: CleanupOptions) -> Result<CleanupReport> {
        for tool in REQUIRED_TOOLS {
            if !self.runner.is_available(tool) {
                return Err(Error::ToolUnavailable(tool.to_string()));
            }
        }
        // fail on a bad prefix before anything destructive runs
        self.discovery.prefixes(scope)?;

        let mut report = CleanupReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        tracing::info!(?scope, dry_run = options.dry_run, "Starting cleanup");

        let sessions = self.discovery.sessions(scope).await?;
        self.remove_all(sessions, options, &mut report).await;
        let processes = self.discovery.processes(scope).await?;
        self.remove_all(processes, options, &mut report).await;
        let projects = self.discovery.compose_projects(scope).await?;
        self.remove_all(projects, options, &mut report).await;
        let containers = self.discovery.containers(scope).await?;
        self.remove_all(containers, options, &mut report).await;
        let state_dirs = self.discovery.state_dirs(scope)?;
        self.remove_all(state_dirs, options, &mut report).await;

        match self.clear_registry(scope, options) {
            Ok(cleared) => report.registry_entries_cleared = cleared,
            Err(e) => report.errors.push(format!("registry: {}", e)),
        }

        tracing::info!(
            removed = report.total_removed(),
            errors = report.errors.len(),
            dry_run = options.dry_run,
            "Cleanup finished"
        );
        Ok(report)
    }

    async fn remove_all(
        &self,
        resources: Vec<DiscoveredResource>,
        options: CleanupOptions,
        report: &mut CleanupReport,
    ) {
        for resource in resources {
            if options.dry_run {
                report.count(resource);
                continue;
            }
            match self.remove(&resource).await {
                Ok(true) => {
                    tracing::info!(kind = %resource.kind, name = %resource.name, "Removed");
                    report.count(resource);
                }
                Ok(false) => {
                    tracing::debug!(kind = %resource.kind, name = %resource.name, "Already gone");
                }
                Err(e) => {
                    tracing::warn!(kind = %resource.kind, name = %resource.name, "Cleanup failed: {}", e);
                    report
                        .errors
                        .push(format!("{} '{}': {}", resource.kind, resource.name, e));
                }
            }
        }
    }

    /// Destroy one resource; `Ok(false)` when it vanished on its own
    async fn remove(&self, resource: &DiscoveredResource) -> Result<bool> {
        match resource.kind {
            DiscoveredKind::Session => {
                let name = validate_name(&resource.name)?;
                // `=` makes tmux match the name exactly instead of by prefix
                let args = vec!["kill-session".into(), "-t".into(), format!("={}", name)];
                self.destroy("tmux", args, &["can't find session", "no server running"])
                    .await
            }
            DiscoveredKind::Process => {
                let pid = resource
                    .pid
                    .ok_or_else(|| Error::Internal(format!("process '{}' has no pid", resource.name)))?;
                self.terminate(pid).await
            }
            DiscoveredKind::ComposeProject => {
                let name = validate_name(&resource.name)?;
                let args = vec![
                    "compose".into(),
                    "-p".into(),
                    name.to_string(),
                    "down".into(),
                    "--volumes".into(),
                    "--remove-orphans".into(),
                ];
                self.destroy("docker", args, &[]).await
            }
            DiscoveredKind::Container => {
                let name = validate_name(&resource.name)?;
                let args = vec!["rm".into(), "-f".into(), name.to_string()];
                self.destroy("docker", args, &["no such container"]).await
            }
            DiscoveredKind::StateDir => {
                validate_name(&resource.name)?;
                let path = resource
                    .path
                    .as_ref()
                    .ok_or_else(|| Error::Internal(format!("state dir '{}' has no path", resource.name)))?;
                match std::fs::remove_dir_all(path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period
    ///
    /// Counts as removed only once the process is confirmed gone.
    async fn terminate(&self, pid: u32) -> Result<bool> {
        if !self.signal(pid, "-TERM").await? {
            return Ok(false);
        }
        if self.wait_for_exit(pid).await {
            return Ok(true);
        }

        tracing::debug!(pid, "Process outlived SIGTERM, sending SIGKILL");
        if !self.signal(pid, "-KILL").await? {
            // exited between the last check and the kill
            return Ok(true);
        }
        if self.wait_for_exit(pid).await {
            return Ok(true);
        }
        Err(Error::command_failed(
            "kill",
            &["-KILL".into(), pid.to_string()],
            "process still running after SIGKILL",
        ))
    }

    async fn signal(&self, pid: u32, signal: &str) -> Result<bool> {
        let args = vec![signal.to_string(), pid.to_string()];
        self.destroy("kill", args, &["no such process"]).await
    }

    /// Poll until `pid` is known to be gone or the grace period runs out
    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.exit_grace;
        loop {
            if self.liveness.is_alive(pid) == Some(false) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn destroy(&self, program: &str, args: Vec<String>, gone: &[&str]) -> Result<bool> {
        let output = self.runner.run(program, &args).await?;
        if output.success() {
            return Ok(true);
        }
        let stderr = output.stderr.to_lowercase();
        if gone.iter().any(|marker| stderr.contains(marker)) {
            return Ok(false);
        }
        Err(Error::command_failed(program, &args, &output.stderr))
    }

    fn clear_registry(&self, scope: Scope, options: CleanupOptions) -> Result<usize> {
        match (scope, options.dry_run) {
            (Scope::Global, false) => self.registry.clear(),
            (Scope::Global, true) => Ok(self.registry.list()?.len()),
            (Scope::Instance(id), false) => Ok(usize::from(self.registry.release(i64::from(id))?)),
            (Scope::Instance(id), true) => Ok(self
                .registry
                .list()?
                .iter()
                .filter(|s| s.record.id == id)
                .count()),
        }
    }
}
