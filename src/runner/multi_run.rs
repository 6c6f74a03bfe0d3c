//! Repeated execution of a single scenario with flakiness statistics

use serde::Serialize;

use crate::common::config::{Config, MultiRunConfig};
use crate::common::{Error, Result};
use crate::scenario::{Scenario, StepKind};

use super::hallucination::{HallucinationDetector, HallucinationOccurrence};
use super::report::{ScenarioReport, StepReport, StepStatus};
use super::sequential::ScenarioRunner;
use super::stats::{percentage, Stats};

#[derive(Debug, Clone)]
pub struct MultiRunOptions {
    pub runs: u32,
    /// Keep going after a failed run
    pub continue_on_failure: bool,
    /// User id for every run
    pub user_id: String,
}

impl MultiRunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self::from_parts(&config.multi_run, &config.parallel.default_user_id)
    }

    fn from_parts(multi_run: &MultiRunConfig, user_id: &str) -> Self {
        Self {
            runs: multi_run.runs,
            continue_on_failure: multi_run.continue_on_failure,
            user_id: user_id.to_string(),
        }
    }
}

/// An error message and how many runs produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

/// Statistics for one step index across runs
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub index: usize,
    pub label: Option<String>,
    pub kind: StepKind,
    pub pass_count: usize,
    /// Failed or errored
    pub fail_count: usize,
    pub skip_count: usize,
    pub pass_rate: f64,
    pub is_flaky: bool,
    /// Milliseconds
    pub duration: Stats,
    pub errors: Vec<ErrorCount>,
    pub hallucinations: usize,
    pub hallucination_rate: f64,
}

/// Scenario-level statistics across runs
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStats {
    pub pass_count: usize,
    pub fail_count: usize,
    pub pass_rate: f64,
    pub is_flaky: bool,
    /// Milliseconds
    pub duration: Stats,
    pub input_tokens: Stats,
    pub output_tokens: Stats,
    pub cost_usd: Stats,
}

/// Result of running one scenario N times
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedScenarioReport {
    pub scenario_id: String,
    pub name: String,
    pub runs_requested: u32,
    pub runs_completed: usize,
    /// Every requested run completed and passed
    pub success: bool,
    pub scenario: ScenarioStats,
    pub steps: Vec<StepStats>,
    pub hallucinations: Vec<HallucinationOccurrence>,
    pub runs: Vec<ScenarioReport>,
}

pub struct MultiRunner {
    runner: ScenarioRunner,
    detector: HallucinationDetector,
    options: MultiRunOptions,
}

impl MultiRunner {
    pub fn new(runner: ScenarioRunner, detector: HallucinationDetector, options: MultiRunOptions) -> Self {
        Self {
            runner,
            detector,
            options,
        }
    }

    /// Run the single scenario in `scenarios` repeatedly
    ///
    /// The scenario's own `runs` wins over the configured count. Anything
    /// other than exactly one scenario, or zero runs, is rejected before the
    /// first run starts.
    pub async fn run(&self, scenarios: &[Scenario]) -> Result<AggregatedScenarioReport> {
        let [scenario] = scenarios else {
            return Err(Error::Config(format!(
                "multi-run needs exactly one scenario, got {}",
                scenarios.len()
            )));
        };
        let runs = scenario.runs.unwrap_or(self.options.runs);
        if runs == 0 {
            return Err(Error::Config("runs must be at least 1".to_string()));
        }

        tracing::info!(scenario = %scenario.id, runs, "Starting multi-run");
        let mut reports = Vec::with_capacity(runs as usize);
        for run in 0..runs {
            let report = self.runner.run(scenario, &self.options.user_id).await;
            let failed = report.status.is_failure();
            tracing::info!(scenario = %scenario.id, run = run + 1, status = ?report.status, "Run finished");
            reports.push(report);
            if failed && !self.options.continue_on_failure {
                tracing::warn!(scenario = %scenario.id, run = run + 1, "Stopping after failed run");
                break;
            }
        }

        Ok(self.aggregate(scenario, runs, reports))
    }

    fn aggregate(&self, scenario: &Scenario, runs: u32, reports: Vec<ScenarioReport>) -> AggregatedScenarioReport {
        // rates are over the runs that actually happened
        let n = reports.len();

        let hallucinations: Vec<HallucinationOccurrence> = reports
            .iter()
            .enumerate()
            .flat_map(|(run, report)| {
                report
                    .steps
                    .iter()
                    .filter_map(move |step| self.detector.detect(run, step))
            })
            .collect();

        let steps = scenario
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let per_run: Vec<&StepReport> =
                    reports.iter().filter_map(|r| r.steps.get(index)).collect();
                let hits = hallucinations
                    .iter()
                    .filter(|h| h.step_index == index)
                    .count();
                step_stats(index, step.label(), step.kind(), &per_run, hits, n)
            })
            .collect();

        let pass_count = reports.iter().filter(|r| r.passed()).count();
        let fail_count = reports.iter().filter(|r| r.status.is_failure()).count();
        let scenario_stats = ScenarioStats {
            pass_count,
            fail_count,
            pass_rate: percentage(pass_count, n),
            is_flaky: pass_count > 0 && pass_count < n,
            duration: Stats::from_values(&collect(&reports, |r| r.duration.as_secs_f64() * 1000.0)),
            input_tokens: Stats::from_values(&collect(&reports, |r| r.usage.input_tokens as f64)),
            output_tokens: Stats::from_values(&collect(&reports, |r| r.usage.output_tokens as f64)),
            cost_usd: Stats::from_values(&collect(&reports, |r| r.usage.cost_usd)),
        };

        let success = n == runs as usize && pass_count == n;
        AggregatedScenarioReport {
            scenario_id: scenario.id.clone(),
            name: scenario.display_name().to_string(),
            runs_requested: runs,
            runs_completed: reports.len(),
            success,
            scenario: scenario_stats,
            steps,
            hallucinations,
            runs: reports,
        }
    }
}

fn collect(reports: &[ScenarioReport], f: impl Fn(&ScenarioReport) -> f64) -> Vec<f64> {
    reports.iter().map(f).collect()
}

fn step_stats(
    index: usize,
    label: Option<&str>,
    kind: StepKind,
    per_run: &[&StepReport],
    hallucinations: usize,
    runs: usize,
) -> StepStats {
    let count = |status: StepStatus| per_run.iter().filter(|s| s.status == status).count();
    let pass_count = count(StepStatus::Passed);
    let fail_count = count(StepStatus::Failed) + count(StepStatus::Error);

    let mut errors: Vec<ErrorCount> = Vec::new();
    for message in per_run.iter().filter_map(|s| s.failure_message()) {
        match errors.iter_mut().find(|e| e.message == message) {
            Some(existing) => existing.count += 1,
            None => errors.push(ErrorCount { message, count: 1 }),
        }
    }

    let durations: Vec<f64> = per_run
        .iter()
        .filter(|s| s.status != StepStatus::Skipped)
        .map(|s| s.duration.as_secs_f64() * 1000.0)
        .collect();

    StepStats {
        index,
        label: label.map(str::to_string),
        kind,
        pass_count,
        fail_count,
        skip_count: count(StepStatus::Skipped),
        pass_rate: percentage(pass_count, runs),
        is_flaky: pass_count > 0 && pass_count < runs,
        duration: Stats::from_values(&durations),
        errors,
        hallucinations,
        hallucination_rate: percentage(hallucinations, runs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChatResponse, MemoryDatabase, ScriptedAgent, ToolCall};
    use crate::common::config::HallucinationConfig;
    use crate::scenario::{ChatStep, Step, ToolAssertion};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scenario(id: &str) -> Scenario {
        let chat = |label: &str, tool: &str| {
            Step::Chat(ChatStep {
                label: Some(label.to_string()),
                message: label.to_string(),
                tools: vec![ToolAssertion::called(tool)],
                ..Default::default()
            })
        };
        Scenario {
            id: id.to_string(),
            name: None,
            description: None,
            tags: vec![],
            setup: vec![],
            steps: vec![
                chat("list", "list_tasks"),
                chat("create", "create_task"),
                chat("remove", "delete_task"),
            ],
            runs: None,
        }
    }

    /// Agent whose third step skips its tool call on the third of every five runs
    fn flaky_agent() -> Arc<ScriptedAgent> {
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(ScriptedAgent::new(move |req| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            let run = call / 3;
            let tool = match req.message.as_str() {
                "list" => "list_tasks",
                "create" => "create_task",
                _ if run % 5 == 2 => "nothing",
                _ => "delete_task",
            };
            Ok(ChatResponse {
                text: format!("Done, I deleted it ({})", req.message),
                tool_calls: vec![ToolCall::new(tool, json!({}))],
                ..Default::default()
            })
        }))
    }

    fn runner(agent: Arc<ScriptedAgent>, runs: u32, continue_on_failure: bool) -> MultiRunner {
        MultiRunner::new(
            ScenarioRunner::new(agent, Arc::new(MemoryDatabase::new())),
            HallucinationDetector::from_config(&HallucinationConfig::default()).unwrap(),
            MultiRunOptions {
                runs,
                continue_on_failure,
                user_id: "u".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_flaky_step_statistics() {
        let report = runner(flaky_agent(), 5, true)
            .run(&[scenario("s")])
            .await
            .unwrap();

        assert_eq!(report.runs_completed, 5);
        assert!(!report.success);

        let step = &report.steps[2];
        assert_eq!(step.pass_count, 4);
        assert_eq!(step.fail_count, 1);
        assert_eq!(step.pass_rate, 80.0);
        assert!(step.is_flaky);
        assert_eq!(step.errors.len(), 1);
        assert_eq!(step.errors[0].count, 1);
        assert_eq!(step.hallucinations, 1);
        assert_eq!(step.hallucination_rate, 20.0);

        let stable = &report.steps[0];
        assert_eq!(stable.pass_count, 5);
        assert!(!stable.is_flaky);
        assert_eq!(stable.hallucinations, 0);

        assert_eq!(report.scenario.pass_count, 4);
        assert_eq!(report.scenario.pass_rate, 80.0);
        assert!(report.scenario.is_flaky);
        assert_eq!(report.hallucinations.len(), 1);
        assert_eq!(report.hallucinations[0].run, 2);
    }

    #[tokio::test]
    async fn test_stop_after_failed_run() {
        let report = runner(flaky_agent(), 5, false)
            .run(&[scenario("s")])
            .await
            .unwrap();
        assert_eq!(report.runs_completed, 3);
        assert_eq!(report.runs_requested, 5);
        assert!(!report.success);

        let stable = &report.steps[0];
        assert_eq!(stable.pass_count, 3);
        assert_eq!(stable.pass_rate, 100.0);
        assert!(!stable.is_flaky);

        let flaky = &report.steps[2];
        assert_eq!((flaky.pass_count, flaky.fail_count), (2, 1));
        assert!(flaky.is_flaky);
        assert!((flaky.hallucination_rate - 100.0 / 3.0).abs() < 1e-9);
        assert!((report.scenario.pass_rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_run_failure_keeps_passing_steps_stable() {
        // "remove" never calls its tool, so run 1 fails and nothing follows
        let agent = Arc::new(ScriptedAgent::new(|req| {
            let tool = match req.message.as_str() {
                "list" => "list_tasks",
                "create" => "create_task",
                _ => "nothing",
            };
            Ok(ChatResponse {
                text: "ok".into(),
                tool_calls: vec![ToolCall::new(tool, json!({}))],
                ..Default::default()
            })
        }));
        let report = runner(agent, 5, false).run(&[scenario("s")]).await.unwrap();

        assert_eq!(report.runs_completed, 1);
        assert!(!report.success);
        let first = &report.steps[0];
        assert_eq!((first.pass_count, first.fail_count), (1, 0));
        assert_eq!(first.pass_rate, 100.0);
        assert!(!first.is_flaky);
        assert_eq!(report.steps[2].pass_rate, 0.0);
        assert!(!report.steps[2].is_flaky);
    }

    #[tokio::test]
    async fn test_scenario_run_count_overrides_options() {
        let agent = Arc::new(ScriptedAgent::replying("ok"));
        let mut one_step = scenario("s");
        one_step.steps.truncate(1);
        if let Step::Chat(chat) = &mut one_step.steps[0] {
            chat.tools.clear();
        }
        one_step.runs = Some(2);

        let report = runner(agent.clone(), 5, true)
            .run(std::slice::from_ref(&one_step))
            .await
            .unwrap();
        assert_eq!(report.runs_requested, 2);
        assert_eq!(report.runs_completed, 2);
        assert!(report.success);
        assert_eq!(agent.calls(), 2);

        one_step.runs = Some(0);
        let err = runner(agent.clone(), 5, true)
            .run(&[one_step])
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_passing_runs() {
        let agent = Arc::new(ScriptedAgent::new(|req| {
            let tool = match req.message.as_str() {
                "list" => "list_tasks",
                "create" => "create_task",
                _ => "delete_task",
            };
            Ok(ChatResponse {
                text: "ok".into(),
                tool_calls: vec![ToolCall::new(tool, json!({}))],
                ..Default::default()
            })
        }));
        let report = runner(agent, 3, true).run(&[scenario("s")]).await.unwrap();
        assert!(report.success);
        assert!(report.steps.iter().all(|s| s.pass_rate == 100.0 && !s.is_flaky));
    }

    #[tokio::test]
    async fn test_rejects_multiple_scenarios_before_running() {
        let agent = flaky_agent();
        let err = runner(agent.clone(), 5, true)
            .run(&[scenario("a"), scenario("b")])
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert_eq!(agent.calls(), 0);

        let err = runner(agent.clone(), 0, true).run(&[scenario("a")]).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(agent.calls(), 0);
    }
}
