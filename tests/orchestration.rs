//! End-to-end tests for scenario orchestration
//!
//! These tests drive the public API with the in-process agent and database:
//! 1. Loading a YAML scenario from `tests/fixtures/scenarios`
//! 2. Running it sequentially, in parallel and repeatedly
//! 3. Checking reports, user isolation and flakiness statistics

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_eval::adapters::{ChatRequest, ChatResponse, MemoryDatabase, ScriptedAgent, ToolCall};
use agent_eval::common::config::{Config, HallucinationConfig, InstanceConfig};
use agent_eval::infra::{InstanceRegistry, MemoryStateStore, SystemLiveness};
use agent_eval::runner::{
    HallucinationDetector, MultiRunOptions, MultiRunner, ParallelOptions, ParallelRunner,
    ScenarioRunner, ScenarioStatus, StepOutput, StepStatus,
};
use agent_eval::scenario::load_scenarios;
use agent_eval::{Result, Scenario};
use serde_json::{json, Value};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("scenarios")
        .join(name)
}

fn todo_flow() -> Scenario {
    load_scenarios(&[fixture("todo_flow.yaml")])
        .expect("fixture should load")
        .remove(0)
}

fn record(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

/// Database with ownership columns on both entities
fn database() -> Arc<MemoryDatabase> {
    Arc::new(
        MemoryDatabase::new()
            .with_ownership("projects", "owner_id")
            .with_ownership("tasks", "owner_id"),
    )
}

/// Replies that perform the todo-flow side effects against `db`
///
/// The reminder row is written by a background task a little later, so the
/// wait step has to poll for it.
fn todo_handler(db: Arc<MemoryDatabase>) -> impl Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync {
    move |req| {
        if req.message.starts_with("Add") {
            let project_id = req
                .message
                .split_whitespace()
                .last()
                .unwrap_or_default()
                .to_string();
            db.seed(
                "tasks",
                record(json!({
                    "title": "buy milk",
                    "project_id": project_id,
                    "owner_id": req.user_id,
                    "done": false
                })),
            );
            Ok(ChatResponse {
                text: "I created the task 'buy milk'.".into(),
                tool_calls: vec![ToolCall::new(
                    "create_task",
                    json!({"title": "buy milk", "project_id": project_id}),
                )],
                ..Default::default()
            })
        } else {
            let db = db.clone();
            let owner = req.user_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                db.seed(
                    "reminders",
                    record(json!({"task_title": "buy milk", "owner_id": owner})),
                );
            });
            Ok(ChatResponse {
                text: "Reminder scheduled.".into(),
                tool_calls: vec![ToolCall::new("schedule_reminder", json!({"in": "1h"}))],
                ..Default::default()
            })
        }
    }
}

fn todo_agent(db: Arc<MemoryDatabase>) -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::new(todo_handler(db)))
}

#[tokio::test]
async fn test_yaml_scenario_passes_end_to_end() {
    let db = database();
    let agent = todo_agent(db.clone());
    let runner = ScenarioRunner::new(agent.clone(), db.clone());
    let scenario = todo_flow();

    let report = runner.run(&scenario, "user-42").await;
    assert_eq!(
        report.status,
        ScenarioStatus::Passed,
        "failures: {:?}",
        report
            .steps
            .iter()
            .filter_map(|s| s.failure_message())
            .collect::<Vec<_>>()
    );
    assert_eq!(report.steps.len(), 4);
    assert_eq!(report.setup.len(), 1);

    // Setup row got the owner and its id flowed into the first message
    let inbox_id = report.captured["inbox"]["id"].as_str().unwrap().to_string();
    assert_eq!(report.captured["inbox"]["owner_id"], json!("user-42"));
    let requests = agent.requests();
    assert_eq!(requests[0].message, format!("Add 'buy milk' to project {}", inbox_id));

    // Both chat steps share the named conversation
    let conversation_ids: Vec<&str> = report
        .steps
        .iter()
        .filter_map(|s| match &s.output {
            StepOutput::Chat {
                conversation_id, ..
            } => Some(conversation_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(conversation_ids.len(), 2);
    assert_eq!(conversation_ids[0], conversation_ids[1]);
    assert_eq!(requests[1].conversation_id.as_deref(), Some(conversation_ids[0]));

    match &report.steps[3].output {
        StepOutput::Wait { attempts } => assert!(*attempts >= 1),
        other => panic!("Expected wait output, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failing_step_skips_the_rest() {
    let db = database();
    // Agent that never calls a tool
    let agent = Arc::new(ScriptedAgent::replying("I created it!"));
    let runner = ScenarioRunner::new(agent, db);

    let report = runner.run(&todo_flow(), "user-1").await;
    assert_eq!(report.status, ScenarioStatus::Failed);
    let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped
        ]
    );
}

#[tokio::test]
async fn test_parallel_run_isolates_users() {
    let db = database();
    let agent = todo_agent(db.clone());
    let runner = ScenarioRunner::new(agent.clone(), db.clone());

    let scenarios: Vec<Scenario> = (0..6)
        .map(|i| {
            let mut s = todo_flow();
            s.id = format!("todo-flow-{}", i);
            s
        })
        .collect();

    let parallel = ParallelRunner::new(
        runner,
        ParallelOptions {
            concurrency: 3,
            ..ParallelOptions::default()
        },
    );
    let summary = parallel.run(&scenarios, None).await.unwrap();

    assert!(summary.success, "reports: {:#?}", summary.reports);
    assert_eq!(summary.reports.len(), 6);
    for (i, report) in summary.reports.iter().enumerate() {
        assert_eq!(report.scenario_id, format!("todo-flow-{}", i));
    }

    let mut users: Vec<&str> = summary.reports.iter().map(|r| r.user_id.as_str()).collect();
    users.sort();
    users.dedup();
    assert_eq!(users.len(), 6);

    // Each scenario's verify step only ever saw its own rows
    let owners: Vec<Value> = db.rows("tasks").iter().map(|r| r["owner_id"].clone()).collect();
    assert_eq!(owners.len(), 6);
    for report in &summary.reports {
        assert!(owners.contains(&json!(report.user_id)));
    }
    assert!(agent.max_in_flight() <= 3);
}

#[tokio::test]
async fn test_multi_run_reports_flaky_step() {
    let db = database();
    let runs = Arc::new(AtomicUsize::new(0));
    let inner = todo_handler(db.clone());

    // Every third "Add" request forgets the tool call but still claims success
    let agent = {
        let runs = runs.clone();
        Arc::new(ScriptedAgent::new(move |req| {
            if req.message.starts_with("Add") && runs.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
                return Ok(ChatResponse {
                    text: "I created the task.".into(),
                    ..Default::default()
                });
            }
            inner(req)
        }))
    };

    let multi = MultiRunner::new(
        ScenarioRunner::new(agent, db),
        HallucinationDetector::from_config(&HallucinationConfig::default()).unwrap(),
        MultiRunOptions {
            runs: 6,
            continue_on_failure: true,
            user_id: "user-1".into(),
        },
    );
    let aggregated = multi.run(&[todo_flow()]).await.unwrap();

    assert_eq!(aggregated.runs_completed, 6);
    assert!(!aggregated.success);
    let first = &aggregated.steps[0];
    assert_eq!(first.pass_count, 4);
    assert_eq!(first.fail_count, 2);
    assert!(first.is_flaky);
    assert_eq!(first.hallucinations, 2);
    assert_eq!(aggregated.scenario.pass_count, 4);
    assert_eq!(aggregated.hallucinations.len(), 2);
}

#[tokio::test]
async fn test_multi_run_rejects_many_scenarios() {
    let agent = Arc::new(ScriptedAgent::replying("hi"));
    let multi = MultiRunner::new(
        ScenarioRunner::new(agent.clone(), database()),
        HallucinationDetector::from_config(&HallucinationConfig::default()).unwrap(),
        MultiRunOptions::from_config(&Config::default()),
    );
    let err = multi.run(&[todo_flow(), todo_flow()]).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(agent.calls(), 0);
}

#[test]
fn test_instance_ports_and_registry() {
    let registry = InstanceRegistry::new(
        Arc::new(MemoryStateStore::new()),
        Arc::new(SystemLiveness),
        InstanceConfig {
            max_instances: 10,
            ..Default::default()
        },
    );

    let ports = registry.ports(5).unwrap();
    assert_eq!(
        (ports.db, ports.api, ports.vector_store, ports.tunnel),
        (5443, 4007, 19537, 6105)
    );
    assert!(registry.ports(10).unwrap_err().is_infrastructure());
    assert!(registry.ports(-1).is_err());

    let record = registry.acquire().unwrap();
    assert_eq!(record.id, 0);
    assert_eq!(registry.available_count().unwrap(), 9);
    assert!(registry.release(0).unwrap());
    assert_eq!(registry.available_count().unwrap(), 10);
}
