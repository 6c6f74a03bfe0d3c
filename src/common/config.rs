//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::{config_path, default_state_dir};
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Sequential runner settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Wait step settings
    #[serde(default)]
    pub wait: WaitConfig,

    /// Parallel orchestrator settings
    #[serde(default)]
    pub parallel: ParallelConfig,

    /// Multi-run aggregator settings
    #[serde(default)]
    pub multi_run: MultiRunConfig,

    /// Hallucination detector settings
    #[serde(default)]
    pub hallucination: HallucinationConfig,

    /// Instance registry settings
    #[serde(default)]
    pub instances: InstanceConfig,
}

/// Sequential runner settings
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Skip the remaining steps once one fails or errors
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,

    /// Timeout for a single agent chat call
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,

    /// Tool call budget passed to the agent when a step does not set one
    #[serde(default)]
    pub max_tool_calls: Option<u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            chat_timeout_secs: default_chat_timeout(),
            max_tool_calls: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_chat_timeout() -> u64 {
    120
}

/// Wait step settings
#[derive(Debug, Deserialize, Clone)]
pub struct WaitConfig {
    /// Interval between condition polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout for condition polling when the step sets none
    #[serde(default = "default_wait_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_timeout_secs: default_wait_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}
fn default_wait_timeout() -> u64 {
    30
}

/// Parallel orchestrator settings
#[derive(Debug, Deserialize, Clone)]
pub struct ParallelConfig {
    /// Maximum number of scenarios running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Give every scenario its own user identity
    #[serde(default = "default_true")]
    pub isolate_users: bool,

    /// Identity shared by all scenarios when isolation is off
    #[serde(default = "default_user_id")]
    pub default_user_id: String,

    /// Stop starting new scenarios after the first failure
    #[serde(default)]
    pub bail: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            isolate_users: true,
            default_user_id: default_user_id(),
            bail: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_user_id() -> String {
    "00000000-0000-4000-8000-000000000001".to_string()
}

/// Multi-run aggregator settings
#[derive(Debug, Deserialize, Clone)]
pub struct MultiRunConfig {
    /// Number of repetitions
    #[serde(default = "default_runs")]
    pub runs: u32,

    /// Keep repeating after a failed run
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
}

impl Default for MultiRunConfig {
    fn default() -> Self {
        Self {
            runs: default_runs(),
            continue_on_failure: true,
        }
    }
}

fn default_runs() -> u32 {
    5
}

/// Hallucination detector settings
#[derive(Debug, Deserialize, Clone)]
pub struct HallucinationConfig {
    /// Action words that claim a side effect happened
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
        }
    }
}

fn default_keywords() -> Vec<String> {
    ["deleted", "created", "updated", "removed", "added", "saved", "scheduled"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Instance registry settings
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Number of instance slots
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    /// Age after which an instance counts as stale
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Prefix for every OS-level resource name
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Prefix used by older releases, still matched during discovery
    #[serde(default = "default_legacy_prefix")]
    pub legacy_prefix: Option<String>,

    /// Base state directory override
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            stale_timeout_secs: default_stale_timeout(),
            prefix: default_prefix(),
            legacy_prefix: default_legacy_prefix(),
            state_dir: None,
        }
    }
}

fn default_max_instances() -> u32 {
    5
}
fn default_stale_timeout() -> u64 {
    3600
}
fn default_prefix() -> String {
    "agent-eval".to_string()
}
fn default_legacy_prefix() -> Option<String> {
    Some("agenteval".to_string())
}

impl InstanceConfig {
    /// Resolved base state directory
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let config: Self =
            toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runner cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.parallel.concurrency == 0 {
            return Err(Error::Config("parallel.concurrency must be at least 1".into()));
        }
        if self.multi_run.runs == 0 {
            return Err(Error::Config("multi_run.runs must be at least 1".into()));
        }
        if self.instances.max_instances == 0 {
            return Err(Error::Config("instances.max_instances must be at least 1".into()));
        }
        if self.wait.poll_interval_ms == 0 {
            return Err(Error::Config("wait.poll_interval_ms must be positive".into()));
        }
        super::paths::validate_name(&self.instances.prefix)?;
        if let Some(legacy) = &self.instances.legacy_prefix {
            super::paths::validate_name(legacy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.runner.stop_on_failure);
        assert_eq!(config.parallel.concurrency, 4);
        assert_eq!(config.instances.max_instances, 5);
        assert_eq!(config.instances.stale_timeout(), Duration::from_secs(3600));
        assert!(config.hallucination.keywords.contains(&"deleted".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[parallel]
concurrency = 8
bail = true

[instances]
prefix = "qa"
"#,
        )
        .unwrap();
        assert_eq!(config.parallel.concurrency, 8);
        assert!(config.parallel.bail);
        assert!(config.parallel.isolate_users);
        assert_eq!(config.instances.prefix, "qa");
        assert_eq!(config.wait.poll_interval_ms, 1000);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.parallel.concurrency = 0;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[multi_run]\nruns = 3\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.multi_run.runs, 3);

        std::fs::write(&path, "[instances]\nprefix = \"bad prefix\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
