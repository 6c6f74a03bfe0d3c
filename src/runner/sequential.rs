//! Sequential scenario runner
//!
//! Drives `scenario.setup` and then `scenario.steps` strictly in order,
//! threading a single [`ExecutionContext`] through every step.

use std::sync::Arc;
use std::time::Instant;

use crate::adapters::{
    Agent, Database, Diagnostics, LifecycleHooks, NoopDiagnostics, NoopHooks, ResultInfo,
    ScenarioInfo,
};
use crate::common::config::Config;
use crate::scenario::Scenario;

use super::context::ExecutionContext;
use super::report::{ScenarioReport, ScenarioStatus, StepReport};
use super::step::{ExecutorConfig, StepExecutor};

/// Step at which a focused run stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStep {
    /// Step with this label
    Label(String),
    /// Zero-based step index
    Index(usize),
}

impl TargetStep {
    /// Parse a CLI-style target: a number is an index, anything else a label
    pub fn parse(s: &str) -> Self {
        match s.parse::<usize>() {
            Ok(index) => TargetStep::Index(index),
            Err(_) => TargetStep::Label(s.to_string()),
        }
    }

    /// Index of the matching step, if any
    pub fn position(&self, scenario: &Scenario) -> Option<usize> {
        match self {
            TargetStep::Index(i) => (*i < scenario.steps.len()).then_some(*i),
            TargetStep::Label(label) => scenario
                .steps
                .iter()
                .position(|s| s.label() == Some(label.as_str())),
        }
    }
}

/// Options for a single scenario execution
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Skip the remaining steps after a failed or errored step
    pub stop_on_failure: bool,
    /// Run only up to and including this step
    pub target_step: Option<TargetStep>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            target_step: None,
        }
    }
}

/// Runs one scenario at a time against fixed collaborators
pub struct ScenarioRunner {
    agent: Arc<dyn Agent>,
    database: Arc<dyn Database>,
    hooks: Arc<dyn LifecycleHooks>,
    diagnostics: Arc<dyn Diagnostics>,
    executor_config: ExecutorConfig,
    options: RunOptions,
}

impl ScenarioRunner {
    pub fn new(agent: Arc<dyn Agent>, database: Arc<dyn Database>) -> Self {
        Self {
            agent,
            database,
            hooks: Arc::new(NoopHooks),
            diagnostics: Arc::new(NoopDiagnostics),
            executor_config: ExecutorConfig::default(),
            options: RunOptions::default(),
        }
    }

    /// Runner with timeouts and stop behaviour taken from the config file
    pub fn from_config(agent: Arc<dyn Agent>, database: Arc<dyn Database>, config: &Config) -> Self {
        Self::new(agent, database)
            .with_executor_config(ExecutorConfig::from(config))
            .with_options(RunOptions {
                stop_on_failure: config.runner.stop_on_failure,
                target_step: None,
            })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Execute a scenario as `user_id`
    ///
    /// The report always holds one entry per configured step; steps that
    /// were not executed are marked skipped.
    pub async fn run(&self, scenario: &Scenario, user_id: &str) -> ScenarioReport {
        let started = Instant::now();
        let info = ScenarioInfo {
            id: scenario.id.clone(),
            name: scenario.display_name().to_string(),
            tags: scenario.tags.clone(),
        };
        tracing::info!(scenario = %scenario.id, user = %user_id, "Starting scenario");

        let executor = StepExecutor::new(
            self.agent.as_ref(),
            self.database.as_ref(),
            &self.executor_config,
        );
        let mut ctx = ExecutionContext::new(user_id);
        let mut error = None;
        let mut halted = false;

        if let Err(e) = self.hooks.before_each(&info, user_id).await {
            tracing::warn!(scenario = %scenario.id, "beforeEach hook failed: {}", e);
            error = Some(format!("beforeEach hook failed: {}", e));
            halted = true;
        }

        let mut setup = Vec::with_capacity(scenario.setup.len());
        if !halted {
            for (i, insert) in scenario.setup.iter().enumerate() {
                let report = executor.execute_insert(i, insert, &mut ctx).await;
                let failed = report.status.is_failure();
                setup.push(report);
                if failed {
                    tracing::warn!(scenario = %scenario.id, insert = i, "Setup insert failed, skipping steps");
                    halted = true;
                    break;
                }
            }
        }

        let target = self.target_index(scenario);
        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (i, step) in scenario.steps.iter().enumerate() {
            if halted {
                steps.push(StepReport::skipped(i, step));
                continue;
            }

            let report = executor.execute(i, step, &mut ctx).await;
            if report.status.is_failure() {
                self.collect_diagnostics(&info, &report).await;
                if self.options.stop_on_failure {
                    halted = true;
                }
            }
            if target == Some(i) {
                tracing::debug!(scenario = %scenario.id, step = i, "Reached target step");
                halted = true;
            }
            steps.push(report);
        }

        let status = if error.is_some() {
            ScenarioStatus::Error
        } else {
            ScenarioStatus::derive(setup.iter().chain(steps.iter()))
        };
        let duration = started.elapsed();

        let result = ResultInfo {
            passed: status == ScenarioStatus::Passed,
            duration,
            error: error.clone().or_else(|| {
                setup
                    .iter()
                    .chain(steps.iter())
                    .find_map(StepReport::failure_message)
            }),
        };
        if let Err(e) = self.hooks.after_each(&info, &result, user_id).await {
            tracing::warn!(scenario = %scenario.id, "afterEach hook failed: {}", e);
        }

        tracing::info!(
            scenario = %scenario.id,
            status = ?status,
            duration_ms = duration.as_millis() as u64,
            "Scenario finished"
        );

        ScenarioReport {
            scenario_id: scenario.id.clone(),
            name: info.name,
            user_id: user_id.to_string(),
            status,
            duration,
            setup,
            steps,
            captured: ctx.captured,
            usage: ctx.usage,
            error,
        }
    }

    fn target_index(&self, scenario: &Scenario) -> Option<usize> {
        let target = self.options.target_step.as_ref()?;
        let index = target.position(scenario);
        if index.is_none() {
            tracing::warn!(scenario = %scenario.id, target = ?target, "Target step not found, running all steps");
        }
        index
    }

    async fn collect_diagnostics(&self, info: &ScenarioInfo, report: &StepReport) {
        if let Err(e) = self.diagnostics.collect(info, report).await {
            tracing::warn!(scenario = %info.id, step = report.index, "Diagnostics collection failed: {}", e);
        }
    }
}
