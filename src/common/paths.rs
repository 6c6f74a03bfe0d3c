//! Configuration and state paths, plus identifier validation
//!
//! Everything derived here may end up in an argument vector for docker,
//! tmux or kill, so dynamic name components go through [`validate_name`].

use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use super::{Error, Result};

/// Name used for config and data directories
const APP_NAME: &str = "agent-eval";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex"));

/// Validate a dynamic name component before it is placed into a command
pub fn validate_name(name: &str) -> Result<&str> {
    if NAME_RE.is_match(name) {
        Ok(name)
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/agent-eval/`
/// - macOS: `~/Library/Application Support/agent-eval/`
/// - Windows: `%APPDATA%\agent-eval\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Base directory holding instance records and per-instance data dirs
pub fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join("state"))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME).join("state"))
}

/// Ensure a directory exists
pub fn ensure_dir(dir: &std::path::Path) -> io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("agent-eval-0-db").is_ok());
        assert!(validate_name("under_score-9").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("x;rm -rf /").is_err());
        assert!(validate_name("$(id)").is_err());
        assert!(validate_name("name\n").is_err());
    }

    #[test]
    fn test_state_dir_is_valid() {
        assert!(!default_state_dir().as_os_str().is_empty());
    }
}
