//! agent-eval - scenario runner for AI agents
//!
//! Drives an agent through scripted conversations, verifies the side effects
//! in its database, and reports pass/fail and flakiness per step. The
//! infrastructure layer reserves isolated test environments and cleans up
//! after them.

pub mod adapters;
pub mod cli;
pub mod commands;
pub mod common;
pub mod infra;
pub mod runner;
pub mod scenario;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use scenario::Scenario;
