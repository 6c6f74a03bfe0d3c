//! Step and scenario reports
//!
//! Reports are plain data consumed by the (external) renderers. Durations
//! serialize as integer milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::adapters::{Record, ToolCall};
use crate::common::{Error, Result};
use crate::scenario::{Scenario, Step, StepKind};

use super::context::UsageTotals;

pub(crate) fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Terminal outcome of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl StepStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Error)
    }
}

/// Lifecycle of a single step
///
/// Pending -> Running -> {Passed, Failed, Error}, or Pending -> Skipped.
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Done(StepStatus),
}

impl StepState {
    pub fn start(self) -> Result<Self> {
        match self {
            StepState::Pending => Ok(StepState::Running),
            other => Err(Error::Internal(format!("cannot start a step in state {:?}", other))),
        }
    }

    pub fn finish(self, status: StepStatus) -> Result<Self> {
        match (self, status) {
            (StepState::Running, StepStatus::Skipped) => Err(Error::Internal(
                "a running step cannot become skipped".to_string(),
            )),
            (StepState::Running, s) => Ok(StepState::Done(s)),
            (StepState::Pending, StepStatus::Skipped) => Ok(StepState::Done(StepStatus::Skipped)),
            (other, s) => Err(Error::Internal(format!(
                "cannot move a step from {:?} to {:?}",
                other, s
            ))),
        }
    }

    pub fn status(self) -> Option<StepStatus> {
        match self {
            StepState::Done(s) => Some(s),
            _ => None,
        }
    }
}

/// Result of one assertion
#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub kind: AssertionKind,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    ToolCall,
    Response,
    EntityFound,
    Field,
}

impl AssertionResult {
    pub fn pass(kind: AssertionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(kind: AssertionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            message: message.into(),
        }
    }
}

/// Step-kind specific output
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutput {
    None,
    Chat {
        response: String,
        tool_calls: Vec<ToolCall>,
        conversation_id: String,
    },
    Verify {
        entities_verified: usize,
    },
    Wait {
        attempts: u32,
    },
    Setup {
        entity: String,
        inserted_id: Option<String>,
        alias: Option<String>,
    },
}

/// Report for one step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub label: Option<String>,
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub assertions: Vec<AssertionResult>,
    pub output: StepOutput,
    pub error: Option<String>,
}

impl StepReport {
    pub fn skipped(index: usize, step: &Step) -> Self {
        Self {
            index,
            label: step.label().map(str::to_string),
            kind: step.kind(),
            status: StepStatus::Skipped,
            duration: Duration::ZERO,
            assertions: Vec::new(),
            output: StepOutput::None,
            error: None,
        }
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &AssertionResult> {
        self.assertions.iter().filter(|a| !a.passed)
    }

    /// The message that best explains a non-passing step
    pub fn failure_message(&self) -> Option<String> {
        match self.status {
            StepStatus::Error => self.error.clone(),
            StepStatus::Failed => self
                .failed_assertions()
                .next()
                .map(|a| a.message.clone())
                .or_else(|| self.error.clone()),
            _ => None,
        }
    }

    /// Reply text for chat steps
    pub fn response_text(&self) -> Option<&str> {
        match &self.output {
            StepOutput::Chat { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Overall outcome of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl ScenarioStatus {
    /// error > failed > passed; skipped only when every entry was skipped
    ///
    /// An empty scenario has nothing that could fail and counts as passed.
    pub fn derive<'a>(steps: impl IntoIterator<Item = &'a StepReport>) -> Self {
        let mut any_failed = false;
        let mut any_ran = false;
        let mut any_step = false;
        for step in steps {
            any_step = true;
            match step.status {
                StepStatus::Error => return ScenarioStatus::Error,
                StepStatus::Failed => any_failed = true,
                StepStatus::Passed => any_ran = true,
                StepStatus::Skipped => {}
            }
        }
        if any_failed {
            ScenarioStatus::Failed
        } else if any_ran || !any_step {
            ScenarioStatus::Passed
        } else {
            ScenarioStatus::Skipped
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ScenarioStatus::Failed | ScenarioStatus::Error)
    }
}

/// Report for one scenario execution
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario_id: String,
    pub name: String,
    pub user_id: String,
    pub status: ScenarioStatus,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    /// Reports for `scenario.setup`
    pub setup: Vec<StepReport>,
    /// One entry per configured step, index-aligned
    pub steps: Vec<StepReport>,
    /// Rows captured under an alias
    pub captured: HashMap<String, Record>,
    pub usage: UsageTotals,
    /// Scenario-level error outside any step (e.g. a failing hook)
    pub error: Option<String>,
}

impl ScenarioReport {
    /// Report for a scenario that was never started
    pub fn not_started(scenario: &Scenario, user_id: &str) -> Self {
        Self {
            scenario_id: scenario.id.clone(),
            name: scenario.display_name().to_string(),
            user_id: user_id.to_string(),
            status: ScenarioStatus::Skipped,
            duration: Duration::ZERO,
            setup: Vec::new(),
            steps: scenario
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| StepReport::skipped(i, s))
                .collect(),
            captured: HashMap::new(),
            usage: UsageTotals::default(),
            error: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
