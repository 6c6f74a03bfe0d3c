//! Scenario definitions
//!
//! Scenarios are plain YAML documents deserialized with serde. No semantic
//! validation happens here beyond what the types enforce.

mod config;

use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

pub use config::*;

impl Scenario {
    /// Parse a scenario from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse scenario: {}", e)))
    }

    /// Load a scenario from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read scenario '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }
}

/// Load several scenario files, rejecting duplicate ids
pub fn load_scenarios(paths: &[PathBuf]) -> Result<Vec<Scenario>> {
    let mut scenarios: Vec<Scenario> = Vec::with_capacity(paths.len());
    for path in paths {
        let scenario = Scenario::load(path)?;
        if scenarios.iter().any(|s| s.id == scenario.id) {
            return Err(Error::Config(format!(
                "Duplicate scenario id '{}' in {}",
                scenario.id,
                path.display()
            )));
        }
        scenarios.push(scenario);
    }
    Ok(scenarios)
}
