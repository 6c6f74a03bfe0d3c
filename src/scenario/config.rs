//! Scenario configuration types
//!
//! Defines the data structures for deserializing YAML scenarios.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Unique scenario id
    pub id: String,
    /// Optional human-readable name
    pub name: Option<String>,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Rows inserted before the first step
    #[serde(default)]
    pub setup: Vec<SetupInsert>,
    /// The sequence of steps to execute, strictly in order
    pub steps: Vec<Step>,
    /// Number of repetitions for multi-run mode
    pub runs: Option<u32>,
}

impl Scenario {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A single step in the execution flow
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Send a message to the agent
    Chat(ChatStep),
    /// Check database rows
    Verify(VerifyStep),
    /// Sleep or poll until a condition holds
    Wait(WaitStep),
    /// Insert a row
    Setup(SetupStep),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Chat(_) => StepKind::Chat,
            Step::Verify(_) => StepKind::Verify,
            Step::Wait(_) => StepKind::Wait,
            Step::Setup(_) => StepKind::Setup,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Step::Chat(s) => s.label.as_deref(),
            Step::Verify(s) => s.label.as_deref(),
            Step::Wait(s) => s.label.as_deref(),
            Step::Setup(s) => s.label.as_deref(),
        }
    }
}

/// Discriminant of a [`Step`]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Chat,
    Verify,
    Wait,
    Setup,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepKind::Chat => "chat",
            StepKind::Verify => "verify",
            StepKind::Wait => "wait",
            StepKind::Setup => "setup",
        })
    }
}

/// Send a message and check the agent's tool calls and reply
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatStep {
    pub label: Option<String>,
    /// Message text; `$userId` and `$alias` references are resolved
    pub message: String,
    /// Named conversation; wins over `continue_conversation`
    pub conversation: Option<String>,
    /// Reuse the most recent conversation of this scenario
    #[serde(default)]
    pub continue_conversation: bool,
    /// Tool call budget for this turn
    pub max_tool_calls: Option<u32>,
    /// Per-call timeout override
    pub timeout_secs: Option<u64>,
    /// Expected tool calls
    #[serde(default)]
    pub tools: Vec<ToolAssertion>,
    /// Expected reply text
    pub response: Option<ResponseAssertion>,
}

/// Expectation about one tool
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolAssertion {
    /// Tool name
    pub name: String,
    /// Whether the tool must be called (default) or must not be called
    #[serde(default = "default_true")]
    pub called: bool,
    /// Exact number of calls
    pub times: Option<u32>,
    pub min_times: Option<u32>,
    pub max_times: Option<u32>,
    /// Arguments that must be present in at least one call (subset match)
    pub args: Option<Map<String, Value>>,
}

fn default_true() -> bool {
    true
}

impl ToolAssertion {
    /// Assertion that a tool was called at least once
    pub fn called(name: &str) -> Self {
        Self {
            name: name.to_string(),
            called: true,
            times: None,
            min_times: None,
            max_times: None,
            args: None,
        }
    }
}

/// Expectation about the reply text
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAssertion {
    /// Substrings that must appear (case-insensitive)
    #[serde(default)]
    pub contains: Vec<String>,
    /// Substrings that must not appear (case-insensitive)
    #[serde(default)]
    pub not_contains: Vec<String>,
    /// Regular expression the reply must match
    pub matches: Option<String>,
}

/// Check one or more database rows
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerifyStep {
    pub label: Option<String>,
    pub entities: Vec<EntityCheck>,
}

/// Lookup of a single row plus the fields it must carry
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct EntityCheck {
    /// Entity (table) name
    pub entity: String,
    /// Row id, may be an `$alias` reference
    pub id: Option<String>,
    /// Row title
    pub title: Option<String>,
    /// Field filter; the first matching row is checked
    pub filter: Option<Map<String, Value>>,
    /// Expected field values
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Sleep for a fixed delay, or poll until a condition holds
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitStep {
    pub label: Option<String>,
    /// Fixed delay in seconds
    pub seconds: Option<f64>,
    /// Condition to poll for
    pub until: Option<EntityCheck>,
    /// Polling budget in seconds
    pub timeout_secs: Option<u64>,
    /// Polling interval override
    pub interval_ms: Option<u64>,
}

/// Insert step inside `steps`
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SetupStep {
    pub label: Option<String>,
    #[serde(flatten)]
    pub insert: SetupInsert,
}

/// A row inserted through the database collaborator
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SetupInsert {
    /// Entity (table) name
    pub entity: String,
    /// Column values; `$alias` and `$userId` references are resolved
    pub data: Map<String, Value>,
    /// Name under which the inserted row is captured
    #[serde(rename = "as", alias = "alias")]
    pub alias: Option<String>,
}
