//! Step executor
//!
//! Runs one step against the agent and database collaborators and turns
//! the outcome into a [`StepReport`]. Collaborator rejections and timeouts
//! are caught here and become status `error`; nothing escapes as `Err`.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::adapters::{Agent, ChatRequest, Database, Record};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::scenario::{ChatStep, EntityCheck, SetupInsert, Step, VerifyStep, WaitStep};

use super::assertions::{check_fields, check_response, check_tools};
use super::context::ExecutionContext;
use super::report::{AssertionKind, AssertionResult, StepOutput, StepReport, StepState, StepStatus};

/// Timeouts and budgets used by the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub chat_timeout: Duration,
    pub max_tool_calls: Option<u32>,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            chat_timeout: Duration::from_secs(config.runner.chat_timeout_secs),
            max_tool_calls: config.runner.max_tool_calls,
            poll_interval: Duration::from_millis(config.wait.poll_interval_ms),
            wait_timeout: Duration::from_secs(config.wait.default_timeout_secs),
        }
    }
}

/// What a step handler produced, before timing and bookkeeping
struct StepOutcome {
    status: StepStatus,
    assertions: Vec<AssertionResult>,
    output: StepOutput,
    error: Option<String>,
}

impl StepOutcome {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            assertions: Vec::new(),
            output: StepOutput::None,
            error: Some(message.into()),
        }
    }

    fn judged(assertions: Vec<AssertionResult>, output: StepOutput) -> Self {
        let status = if assertions.iter().all(|a| a.passed) {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        Self {
            status,
            assertions,
            output,
            error: None,
        }
    }
}

/// Executes single steps against injected collaborators
pub struct StepExecutor<'a> {
    agent: &'a dyn Agent,
    database: &'a dyn Database,
    config: &'a ExecutorConfig,
}

impl<'a> StepExecutor<'a> {
    pub fn new(agent: &'a dyn Agent, database: &'a dyn Database, config: &'a ExecutorConfig) -> Self {
        Self {
            agent,
            database,
            config,
        }
    }

    /// Execute one step, mutating the scenario's context
    pub async fn execute(&self, index: usize, step: &Step, ctx: &mut ExecutionContext) -> StepReport {
        let started = Instant::now();
        let outcome = match StepState::Pending.start() {
            Ok(running) => {
                let outcome = match step {
                    Step::Chat(chat) => self.chat(chat, ctx).await,
                    Step::Verify(verify) => self.verify(verify, ctx).await,
                    Step::Wait(wait) => self.wait(wait, ctx).await,
                    Step::Setup(setup) => self.setup(&setup.insert, ctx).await,
                };
                match running.finish(outcome.status) {
                    Ok(_) => outcome,
                    Err(e) => StepOutcome::error(e.to_string()),
                }
            }
            Err(e) => StepOutcome::error(e.to_string()),
        };

        let report = StepReport {
            index,
            label: step.label().map(str::to_string),
            kind: step.kind(),
            status: outcome.status,
            duration: started.elapsed(),
            assertions: outcome.assertions,
            output: outcome.output,
            error: outcome.error,
        };

        match report.status {
            StepStatus::Passed => tracing::debug!(step = index, kind = %report.kind, "Step passed"),
            _ => tracing::debug!(
                step = index,
                kind = %report.kind,
                status = ?report.status,
                reason = report.failure_message().as_deref().unwrap_or(""),
                "Step did not pass"
            ),
        }
        report
    }

    /// Execute a `setup` insert from the scenario header
    pub async fn execute_insert(
        &self,
        index: usize,
        insert: &SetupInsert,
        ctx: &mut ExecutionContext,
    ) -> StepReport {
        let started = Instant::now();
        let outcome = self.setup(insert, ctx).await;
        StepReport {
            index,
            label: insert.alias.clone(),
            kind: crate::scenario::StepKind::Setup,
            status: outcome.status,
            duration: started.elapsed(),
            assertions: outcome.assertions,
            output: outcome.output,
            error: outcome.error,
        }
    }

    async fn chat(&self, step: &ChatStep, ctx: &mut ExecutionContext) -> StepOutcome {
        // Named conversation > continueConversation > fresh
        let conversation_id = match &step.conversation {
            Some(name) => ctx.conversations.get(name).cloned(),
            None if step.continue_conversation => ctx.conversation_id.clone(),
            None => None,
        };
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.chat_timeout);

        let request = ChatRequest {
            message: ctx.resolve_str(&step.message),
            user_id: ctx.user_id.clone(),
            conversation_id,
            max_tool_calls: step.max_tool_calls.or(self.config.max_tool_calls),
            timeout: Some(timeout),
        };

        let response = match tokio::time::timeout(timeout, self.agent.chat(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return StepOutcome::error(e.to_string()),
            Err(_) => return StepOutcome::error(Error::Timeout(timeout.as_millis() as u64).to_string()),
        };

        ctx.conversation_id = Some(response.conversation_id.clone());
        if let Some(name) = &step.conversation {
            ctx.conversations
                .insert(name.clone(), response.conversation_id.clone());
        }
        for event in &response.usage {
            ctx.usage.record(event);
        }

        let tools: Vec<_> = step
            .tools
            .iter()
            .map(|t| {
                let mut t = t.clone();
                t.args = t.args.map(|args| ctx.resolve_record(&args));
                t
            })
            .collect();
        let mut assertions = check_tools(&tools, &response.tool_calls);
        if let Some(expected) = &step.response {
            let mut expected = expected.clone();
            for needle in expected.contains.iter_mut().chain(expected.not_contains.iter_mut()) {
                *needle = ctx.resolve_str(needle);
            }
            assertions.extend(check_response(&expected, &response.text));
        }

        StepOutcome::judged(
            assertions,
            StepOutput::Chat {
                response: response.text,
                tool_calls: response.tool_calls,
                conversation_id: response.conversation_id,
            },
        )
    }

    async fn verify(&self, step: &VerifyStep, ctx: &ExecutionContext) -> StepOutcome {
        let mut assertions = Vec::new();
        let mut verified = 0;

        for check in &step.entities {
            let row = match self.lookup(check, ctx).await {
                Ok(row) => row,
                Err(e) => return StepOutcome::error(e.to_string()),
            };
            match row {
                Some(row) => {
                    assertions.push(AssertionResult::pass(
                        AssertionKind::EntityFound,
                        format!("{} {} found", check.entity, describe(check)),
                    ));
                    let expected = ctx.resolve_record(&check.fields);
                    let fields = check_fields(&check.entity, &expected, &row);
                    if fields.iter().all(|a| a.passed) {
                        verified += 1;
                    }
                    assertions.extend(fields);
                }
                None => assertions.push(AssertionResult::fail(
                    AssertionKind::EntityFound,
                    format!("{} {} not found", check.entity, describe(check)),
                )),
            }
        }

        StepOutcome::judged(
            assertions,
            StepOutput::Verify {
                entities_verified: verified,
            },
        )
    }

    async fn wait(&self, step: &WaitStep, ctx: &ExecutionContext) -> StepOutcome {
        if step.seconds.is_none() && step.until.is_none() {
            return StepOutcome::error("wait step needs 'seconds' or 'until'");
        }

        if let Some(seconds) = step.seconds {
            // negative clamps to zero, NaN and overflow are rejected
            let clamped = if seconds < 0.0 { 0.0 } else { seconds };
            let Ok(delay) = Duration::try_from_secs_f64(clamped) else {
                return StepOutcome::error(format!("wait of {} seconds is not a valid delay", seconds));
            };
            tokio::time::sleep(delay).await;
        }

        let Some(condition) = &step.until else {
            return StepOutcome::judged(Vec::new(), StepOutput::Wait { attempts: 0 });
        };

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.wait_timeout);
        let interval = step
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.poll_interval);

        let mut attempts = 0;
        let executor = self;
        let polled = tokio::time::timeout(
            timeout,
            poll_until(
                interval,
                timeout,
                move || executor.condition_holds(condition, ctx),
                |n| attempts = n,
            ),
        )
        .await;

        let output = StepOutput::Wait { attempts };
        match polled {
            Ok(Ok(true)) => StepOutcome::judged(
                vec![AssertionResult::pass(
                    AssertionKind::EntityFound,
                    format!("{} {} satisfied after {} attempt(s)", condition.entity, describe(condition), attempts),
                )],
                output,
            ),
            Ok(Ok(false)) | Err(_) => StepOutcome::judged(
                vec![AssertionResult::fail(
                    AssertionKind::EntityFound,
                    format!(
                        "{} {} not satisfied within {}s ({} attempt(s))",
                        condition.entity,
                        describe(condition),
                        timeout.as_secs_f64(),
                        attempts
                    ),
                )],
                output,
            ),
            Ok(Err(e)) => StepOutcome {
                output,
                ..StepOutcome::error(e.to_string())
            },
        }
    }

    async fn setup(&self, insert: &SetupInsert, ctx: &mut ExecutionContext) -> StepOutcome {
        let mut data = ctx.resolve_record(&insert.data);

        let schema = match self.database.schema(&insert.entity).await {
            Ok(schema) => schema,
            Err(e) => return StepOutcome::error(e.to_string()),
        };
        if let Some(column) = schema.ownership_column {
            data.entry(column)
                .or_insert_with(|| Value::String(ctx.user_id.clone()));
        }

        let row = match self.database.insert(&insert.entity, data).await {
            Ok(row) => row,
            Err(e) => return StepOutcome::error(e.to_string()),
        };

        let inserted_id = row.get("id").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if let Some(alias) = &insert.alias {
            ctx.capture(alias, row);
        }

        StepOutcome::judged(
            Vec::new(),
            StepOutput::Setup {
                entity: insert.entity.clone(),
                inserted_id,
                alias: insert.alias.clone(),
            },
        )
    }

    /// Find the row an entity check refers to
    async fn lookup(&self, check: &EntityCheck, ctx: &ExecutionContext) -> Result<Option<Record>> {
        if let Some(id) = &check.id {
            return self.database.find_by_id(&check.entity, &ctx.resolve_str(id)).await;
        }
        if let Some(title) = &check.title {
            return self
                .database
                .find_by_title(&check.entity, &ctx.resolve_str(title))
                .await;
        }
        if let Some(filter) = &check.filter {
            let rows = self
                .database
                .list(&check.entity, &ctx.resolve_record(filter))
                .await?;
            return Ok(rows.into_iter().next());
        }
        Err(Error::Config(format!(
            "check on '{}' needs 'id', 'title' or 'filter'",
            check.entity
        )))
    }

    async fn condition_holds(&self, check: &EntityCheck, ctx: &ExecutionContext) -> Result<bool> {
        let Some(row) = self.lookup(check, ctx).await? else {
            return Ok(false);
        };
        let expected = ctx.resolve_record(&check.fields);
        Ok(check_fields(&check.entity, &expected, &row)
            .iter()
            .all(|a| a.passed))
    }
}

fn describe(check: &EntityCheck) -> String {
    if let Some(id) = &check.id {
        format!("id={}", id)
    } else if let Some(title) = &check.title {
        format!("title='{}'", title)
    } else if let Some(filter) = &check.filter {
        format!("filter={}", Value::Object(filter.clone()))
    } else {
        "(no selector)".to_string()
    }
}

/// Poll `check` every `interval` until it returns true or `timeout` elapses
///
/// `on_attempt` receives the running attempt count before every check.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
    mut on_attempt: impl FnMut(u32),
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0;
    loop {
        attempt += 1;
        on_attempt(attempt);
        if check().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
