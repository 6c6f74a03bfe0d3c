//! Per-scenario mutable run state

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use crate::adapters::{Record, UsageEvent};

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?").expect("static regex")
});

/// Accumulated usage for one scenario execution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model_calls: u64,
    pub tool_executions: u64,
}

impl UsageTotals {
    pub fn record(&mut self, event: &UsageEvent) {
        match event {
            UsageEvent::ModelCall {
                input_tokens,
                output_tokens,
                cost_usd,
                ..
            } => {
                self.input_tokens += input_tokens;
                self.output_tokens += output_tokens;
                self.cost_usd += cost_usd;
                self.model_calls += 1;
            }
            UsageEvent::ToolExecution { .. } => self.tool_executions += 1,
            UsageEvent::Embedding { tokens, cost_usd } => {
                self.input_tokens += tokens;
                self.cost_usd += cost_usd;
            }
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// State threaded through the steps of exactly one scenario execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user_id: String,
    /// Most recent conversation, used by `continueConversation`
    pub conversation_id: Option<String>,
    /// Named conversations
    pub conversations: HashMap<String, String>,
    /// Rows captured under an alias
    pub captured: HashMap<String, Record>,
    pub usage: UsageTotals,
}

impl ExecutionContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: None,
            conversations: HashMap::new(),
            captured: HashMap::new(),
            usage: UsageTotals::default(),
        }
    }

    /// Value a single `$name` / `$name.field` reference points to
    fn lookup(&self, name: &str, field: Option<&str>) -> Option<Value> {
        if name == "userId" && field.is_none() {
            return Some(Value::String(self.user_id.clone()));
        }
        let row = self.captured.get(name)?;
        row.get(field.unwrap_or("id")).cloned()
    }

    /// Replace references inside a string; unknown references stay verbatim
    pub fn resolve_str(&self, text: &str) -> String {
        REFERENCE_RE
            .replace_all(text, |caps: &Captures| {
                let name = &caps[1];
                let field = caps.get(2).map(|m| m.as_str());
                match self.lookup(name, field) {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Resolve references anywhere inside a JSON value
    ///
    /// A string that is exactly one reference takes the referenced value's
    /// type, so `$task.done` can resolve to a boolean.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(caps) = REFERENCE_RE.captures(s) {
                    if caps[0].len() == s.len() {
                        if let Some(v) = self.lookup(&caps[1], caps.get(2).map(|m| m.as_str())) {
                            return v;
                        }
                    }
                }
                Value::String(self.resolve_str(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(self.resolve_record(map)),
            other => other.clone(),
        }
    }

    pub fn resolve_record(&self, record: &Record) -> Record {
        record
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    /// Capture a row under an alias
    pub fn capture(&mut self, alias: &str, row: Record) {
        self.captured.insert(alias.to_string(), row);
    }
}
