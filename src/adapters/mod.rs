//! Collaborator interfaces consumed by the runner
//!
//! The agent, the database, lifecycle hooks and diagnostics collection are
//! all external to the runner. Each is a trait object chosen once when the
//! runner is built; concrete HTTP or SQL adapters live outside this crate.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::{Error, Result};
use crate::runner::report::{ScenarioReport, StepReport};

pub use memory::{MemoryDatabase, NoopDiagnostics, NoopHooks, ScriptedAgent};

/// A database row
pub type Record = Map<String, Value>;

/// One agent turn
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub user_id: String,
    /// Existing conversation to continue, `None` for a fresh one
    pub conversation_id: Option<String>,
    pub max_tool_calls: Option<u32>,
    pub timeout: Option<Duration>,
}

/// Normalized agent reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub conversation_id: String,
    #[serde(default)]
    pub usage: Vec<UsageEvent>,
}

/// A tool invocation reported by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

/// Usage record attached to an agent reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageEvent {
    /// One model completion
    ModelCall {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
    /// A tool executed on the agent side
    ToolExecution { tool: String, duration_ms: u64 },
    /// An embedding request
    Embedding {
        tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
}

/// The agent under test
#[async_trait]
pub trait Agent: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}

/// Schema information the runner needs about an entity
#[derive(Debug, Clone, Default)]
pub struct EntitySchema {
    /// Column holding the owning user id, if the entity has one
    pub ownership_column: Option<String>,
}

/// The data store the agent writes to
#[async_trait]
pub trait Database: Send + Sync {
    async fn find_by_id(&self, entity: &str, id: &str) -> Result<Option<Record>>;

    async fn find_by_title(&self, entity: &str, title: &str) -> Result<Option<Record>>;

    async fn list(&self, entity: &str, filter: &Record) -> Result<Vec<Record>>;

    /// Insert a row and return it as stored, including its id
    async fn insert(&self, entity: &str, data: Record) -> Result<Record>;

    async fn update(&self, _entity: &str, _id: &str, _data: Record) -> Result<Option<Record>> {
        Err(Error::Unsupported("update".into()))
    }

    async fn delete(&self, _entity: &str, _id: &str) -> Result<bool> {
        Err(Error::Unsupported("delete".into()))
    }

    async fn schema(&self, entity: &str) -> Result<EntitySchema>;
}

/// Minimal scenario description handed to hooks
#[derive(Debug, Clone)]
pub struct ScenarioInfo {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// Outcome handed to the after-each hook
#[derive(Debug, Clone)]
pub struct ResultInfo {
    pub passed: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Per-scenario lifecycle hooks
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn before_each(&self, _scenario: &ScenarioInfo, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn after_each(
        &self,
        _scenario: &ScenarioInfo,
        _result: &ResultInfo,
        _user_id: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Trace and log collection after a failing step
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn collect(&self, scenario: &ScenarioInfo, step: &StepReport) -> Result<()>;
}

/// Start/completion notifications from the parallel orchestrator
///
/// Calls may interleave arbitrarily across scenarios.
pub trait ProgressListener: Send + Sync {
    fn on_scenario_start(&self, _index: usize, _scenario_id: &str, _user_id: &str) {}

    fn on_scenario_complete(&self, _index: usize, _report: &ScenarioReport) {}
}
