//! In-process collaborator implementations
//!
//! `ScriptedAgent` replies through a caller-supplied function and
//! `MemoryDatabase` keeps rows in memory. Both are used for dry runs of
//! scenario files and throughout the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    Agent, ChatRequest, ChatResponse, Database, Diagnostics, EntitySchema, LifecycleHooks, Record,
    ScenarioInfo,
};
use crate::common::Result;
use crate::runner::report::StepReport;

type Handler = dyn Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync;

/// Agent whose replies come from a function
///
/// An empty `conversation_id` in the produced reply is filled in: the
/// requested conversation is echoed back, otherwise a fresh id is minted.
pub struct ScriptedAgent {
    handler: Box<Handler>,
    latency: Duration,
    next_conversation: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedAgent {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<ChatResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            next_conversation: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Agent that always answers with the same text and no tool calls
    pub fn replying(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| {
            Ok(ChatResponse {
                text: text.clone(),
                ..Default::default()
            })
        })
    }

    /// Simulated round-trip time for every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Highest number of calls that were in progress at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = (self.handler)(&request).map(|mut response| {
            if response.conversation_id.is_empty() {
                response.conversation_id = match &request.conversation_id {
                    Some(id) => id.clone(),
                    None => format!(
                        "conv-{}",
                        self.next_conversation.fetch_add(1, Ordering::SeqCst)
                    ),
                };
            }
            response
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Record>>,
    schemas: HashMap<String, EntitySchema>,
    next_id: u64,
}

/// Database that keeps rows in memory
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the ownership column of an entity
    pub fn with_ownership(self, entity: &str, column: &str) -> Self {
        self.tables.lock().schemas.insert(
            entity.to_string(),
            EntitySchema {
                ownership_column: Some(column.to_string()),
            },
        );
        self
    }

    /// Insert a row directly, bypassing the collaborator interface
    pub fn seed(&self, entity: &str, row: Record) -> Record {
        let mut tables = self.tables.lock();
        Self::store(&mut tables, entity, row)
    }

    /// Snapshot of an entity's rows
    pub fn rows(&self, entity: &str) -> Vec<Record> {
        self.tables
            .lock()
            .rows
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    fn store(tables: &mut Tables, entity: &str, mut row: Record) -> Record {
        if !row.contains_key("id") {
            tables.next_id += 1;
            row.insert("id".into(), Value::String(format!("row-{}", tables.next_id)));
        }
        tables
            .rows
            .entry(entity.to_string())
            .or_default()
            .push(row.clone());
        row
    }
}

fn id_matches(row: &Record, id: &str) -> bool {
    match row.get("id") {
        Some(Value::String(s)) => s == id,
        Some(other) => other.to_string() == id,
        None => false,
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn find_by_id(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        let tables = self.tables.lock();
        Ok(tables
            .rows
            .get(entity)
            .and_then(|rows| rows.iter().find(|r| id_matches(r, id)).cloned()))
    }

    async fn find_by_title(&self, entity: &str, title: &str) -> Result<Option<Record>> {
        let tables = self.tables.lock();
        Ok(tables.rows.get(entity).and_then(|rows| {
            rows.iter()
                .find(|r| {
                    ["title", "name"]
                        .iter()
                        .any(|k| r.get(*k).and_then(Value::as_str) == Some(title))
                })
                .cloned()
        }))
    }

    async fn list(&self, entity: &str, filter: &Record) -> Result<Vec<Record>> {
        let tables = self.tables.lock();
        Ok(tables
            .rows
            .get(entity)
            .map(|rows| {
                rows.iter()
                    .filter(|r| filter.iter().all(|(k, v)| r.get(k) == Some(v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, entity: &str, data: Record) -> Result<Record> {
        let mut tables = self.tables.lock();
        Ok(Self::store(&mut tables, entity, data))
    }

    async fn update(&self, entity: &str, id: &str, data: Record) -> Result<Option<Record>> {
        let mut tables = self.tables.lock();
        let Some(row) = tables
            .rows
            .get_mut(entity)
            .and_then(|rows| rows.iter_mut().find(|r| id_matches(r, id)))
        else {
            return Ok(None);
        };
        for (k, v) in data {
            row.insert(k, v);
        }
        Ok(Some(row.clone()))
    }

    async fn delete(&self, entity: &str, id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(rows) = tables.rows.get_mut(entity) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|r| !id_matches(r, id));
        Ok(rows.len() != before)
    }

    async fn schema(&self, entity: &str) -> Result<EntitySchema> {
        Ok(self
            .tables
            .lock()
            .schemas
            .get(entity)
            .cloned()
            .unwrap_or_default())
    }
}

/// Hooks that do nothing
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Diagnostics collector that only logs
pub struct NoopDiagnostics;

#[async_trait]
impl Diagnostics for NoopDiagnostics {
    async fn collect(&self, scenario: &ScenarioInfo, step: &StepReport) -> Result<()> {
        tracing::debug!(
            scenario = %scenario.id,
            step = step.index,
            "No diagnostics collector configured"
        );
        Ok(())
    }
}
