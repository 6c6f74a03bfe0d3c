//! Bounded-concurrency scenario orchestration
//!
//! Up to `concurrency` scenarios run at once on the calling task. A freed
//! slot is filled with the next pending scenario immediately.

use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::adapters::ProgressListener;
use crate::common::config::ParallelConfig;
use crate::common::{Error, Result};
use crate::scenario::Scenario;

use super::isolation::UserIsolationManager;
use super::report::ScenarioReport;
use super::sequential::ScenarioRunner;

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Maximum number of simultaneously running scenarios
    pub concurrency: usize,
    /// Give every scenario its own user id
    pub isolate_users: bool,
    /// User id shared by all scenarios when isolation is off
    pub default_user_id: String,
    /// Stop starting new scenarios after the first failure
    pub bail: bool,
}

impl From<&ParallelConfig> for ParallelOptions {
    fn from(config: &ParallelConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            isolate_users: config.isolate_users,
            default_user_id: config.default_user_id.clone(),
            bail: config.bail,
        }
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::from(&ParallelConfig::default())
    }
}

/// Outcome of a parallel run
#[derive(Debug)]
pub struct ParallelRunSummary {
    /// True when nothing failed and nothing was suppressed by bail
    pub success: bool,
    /// One report per input scenario, in input order
    pub reports: Vec<ScenarioReport>,
    /// Bail kept at least one scenario from starting
    pub bailed: bool,
    /// Identities handed out during the run
    pub isolation: UserIsolationManager,
}

impl ParallelRunSummary {
    pub fn passed_count(&self) -> usize {
        self.reports.iter().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.reports.iter().filter(|r| r.status.is_failure()).count()
    }
}

pub struct ParallelRunner {
    runner: ScenarioRunner,
    options: ParallelOptions,
}

impl ParallelRunner {
    pub fn new(runner: ScenarioRunner, options: ParallelOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }

    /// Run every scenario with at most `concurrency` in flight
    ///
    /// A failing scenario never affects its siblings. An invalid concurrency
    /// is rejected before anything starts.
    pub async fn run(
        &self,
        scenarios: &[Scenario],
        listener: Option<&dyn ProgressListener>,
    ) -> Result<ParallelRunSummary> {
        let concurrency = self.options.concurrency;
        if concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }

        let isolation =
            UserIsolationManager::new(self.options.isolate_users, &self.options.default_user_id);
        tracing::info!(
            scenarios = scenarios.len(),
            concurrency,
            isolate_users = self.options.isolate_users,
            "Starting parallel run"
        );

        let runner = &self.runner;
        let start = |index: usize| {
            let scenario = &scenarios[index];
            let user_id = isolation.get_user_id(&scenario.id);
            if let Some(listener) = listener {
                listener.on_scenario_start(index, &scenario.id, &user_id);
            }
            async move { (index, runner.run(scenario, &user_id).await) }
        };

        let mut in_flight = FuturesUnordered::new();
        let mut next = 0;
        let mut stop_starting = false;
        let mut finished: Vec<(usize, ScenarioReport)> = Vec::with_capacity(scenarios.len());

        while next < scenarios.len() && in_flight.len() < concurrency {
            in_flight.push(start(next));
            next += 1;
        }

        while let Some((index, report)) = in_flight.next().await {
            if let Some(listener) = listener {
                listener.on_scenario_complete(index, &report);
            }
            if self.options.bail && report.status.is_failure() && !stop_starting {
                tracing::warn!(scenario = %report.scenario_id, "Scenario failed, not starting further scenarios");
                stop_starting = true;
            }
            finished.push((index, report));

            while !stop_starting && next < scenarios.len() && in_flight.len() < concurrency {
                in_flight.push(start(next));
                next += 1;
            }
        }
        drop(in_flight);

        let bailed = next < scenarios.len();
        for (index, scenario) in scenarios.iter().enumerate().skip(next) {
            let user_id = isolation.get_user_id(&scenario.id);
            finished.push((index, ScenarioReport::not_started(scenario, &user_id)));
        }

        finished.sort_by_key(|(index, _)| *index);
        let reports: Vec<ScenarioReport> = finished.into_iter().map(|(_, r)| r).collect();
        let success = !bailed && reports.iter().all(|r| !r.status.is_failure());

        tracing::info!(
            passed = reports.iter().filter(|r| r.passed()).count(),
            total = reports.len(),
            bailed,
            "Parallel run finished"
        );

        Ok(ParallelRunSummary {
            success,
            reports,
            bailed,
            isolation,
        })
    }
}
