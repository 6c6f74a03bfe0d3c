//! Error types for the scenario runner
//!
//! Configuration and infrastructure errors are raised to the caller
//! immediately. Adapter and timeout errors are caught at the step boundary
//! and recorded in the step report instead of being propagated.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scenario runner
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Adapter Errors ===
    #[error("Agent rejected the request: {0}")]
    AgentRejected(String),

    #[error("Database rejected the request: {0}")]
    DatabaseRejected(String),

    #[error("Operation '{0}' is not supported by this adapter")]
    Unsupported(String),

    // === Timeout Errors ===
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    // === Infrastructure Errors ===
    #[error("Invalid identifier '{0}': only [a-zA-Z0-9_-] is allowed")]
    InvalidIdentifier(String),

    #[error("Instance id {id} is out of range (0..{max})")]
    InstanceOutOfRange { id: i64, max: u32 },

    #[error("No instance slot available ({max} in use)")]
    NoInstanceAvailable { max: u32 },

    #[error("Required tool '{0}' was not found in PATH")]
    ToolUnavailable(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Instance state store error: {0}")]
    StateStore(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a command failed error
    pub fn command_failed(program: &str, args: &[String], message: &str) -> Self {
        let mut command = program.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        Self::CommandFailed {
            command,
            message: message.trim().to_string(),
        }
    }

    /// Whether this error signals a bad configuration that should fail fast
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::FileRead { .. } | Error::Yaml(_)
        )
    }

    /// Whether this error signals a usage or environment mistake in the
    /// infrastructure layer
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::InvalidIdentifier(_)
                | Error::InstanceOutOfRange { .. }
                | Error::NoInstanceAvailable { .. }
                | Error::ToolUnavailable(_)
                | Error::CommandFailed { .. }
                | Error::StateStore(_)
        )
    }

    /// Whether this error came from an agent or database collaborator
    pub fn is_adapter(&self) -> bool {
        matches!(
            self,
            Error::AgentRejected(_) | Error::DatabaseRejected(_) | Error::Unsupported(_)
        )
    }
}
