//! Assertion evaluation for chat and verify steps
//!
//! Failures are data, never errors: every check produces an
//! [`AssertionResult`] and the caller derives the step status from them.

use regex::RegexBuilder;
use serde_json::Value;

use crate::adapters::{Record, ToolCall};
use crate::scenario::{ResponseAssertion, ToolAssertion};

use super::report::{AssertionKind, AssertionResult};

/// Check the tool calls of one agent turn
pub fn check_tools(expected: &[ToolAssertion], calls: &[ToolCall]) -> Vec<AssertionResult> {
    expected.iter().map(|a| check_tool(a, calls)).collect()
}

fn check_tool(assertion: &ToolAssertion, calls: &[ToolCall]) -> AssertionResult {
    let named: Vec<&ToolCall> = calls.iter().filter(|c| c.name == assertion.name).collect();
    let count = match &assertion.args {
        Some(args) => named
            .iter()
            .filter(|c| args_subset(args, &c.arguments))
            .count(),
        None => named.len(),
    } as u32;
    let name = &assertion.name;

    if !assertion.called {
        return if named.is_empty() {
            AssertionResult::pass(AssertionKind::ToolCall, format!("'{}' was not called", name))
        } else {
            AssertionResult::fail(
                AssertionKind::ToolCall,
                format!("'{}' should not be called, was called {} time(s)", name, named.len()),
            )
        };
    }

    if let Some(times) = assertion.times {
        if count != times {
            return AssertionResult::fail(
                AssertionKind::ToolCall,
                format!("'{}' expected {} call(s), got {}", name, times, count),
            );
        }
    }
    if let Some(min) = assertion.min_times {
        if count < min {
            return AssertionResult::fail(
                AssertionKind::ToolCall,
                format!("'{}' expected at least {} call(s), got {}", name, min, count),
            );
        }
    }
    if let Some(max) = assertion.max_times {
        if count > max {
            return AssertionResult::fail(
                AssertionKind::ToolCall,
                format!("'{}' expected at most {} call(s), got {}", name, max, count),
            );
        }
    }
    if assertion.times.is_none() && assertion.min_times.is_none() && count == 0 {
        let message = if named.is_empty() {
            let seen: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            format!("'{}' was never called. Called: {:?}", name, seen)
        } else {
            format!("'{}' was called, but never with the expected arguments", name)
        };
        return AssertionResult::fail(AssertionKind::ToolCall, message);
    }

    AssertionResult::pass(
        AssertionKind::ToolCall,
        format!("'{}' called {} time(s)", name, count),
    )
}

/// Whether every expected argument is present in the actual arguments
fn args_subset(expected: &Record, actual: &Value) -> bool {
    let Some(actual) = actual.as_object() else {
        return expected.is_empty();
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|a| values_match(v, a)))
}

/// Check the reply text
pub fn check_response(assertion: &ResponseAssertion, text: &str) -> Vec<AssertionResult> {
    let lower = text.to_lowercase();
    let mut results = Vec::new();

    for needle in &assertion.contains {
        results.push(if lower.contains(&needle.to_lowercase()) {
            AssertionResult::pass(AssertionKind::Response, format!("contains '{}'", needle))
        } else {
            AssertionResult::fail(
                AssertionKind::Response,
                format!("response does not contain '{}'. Got: '{}'", needle, excerpt(text)),
            )
        });
    }

    for needle in &assertion.not_contains {
        results.push(if lower.contains(&needle.to_lowercase()) {
            AssertionResult::fail(
                AssertionKind::Response,
                format!("response should not contain '{}'", needle),
            )
        } else {
            AssertionResult::pass(AssertionKind::Response, format!("does not contain '{}'", needle))
        });
    }

    if let Some(pattern) = &assertion.matches {
        results.push(
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) if re.is_match(text) => {
                    AssertionResult::pass(AssertionKind::Response, format!("matches /{}/", pattern))
                }
                Ok(_) => AssertionResult::fail(
                    AssertionKind::Response,
                    format!("response does not match /{}/. Got: '{}'", pattern, excerpt(text)),
                ),
                Err(e) => AssertionResult::fail(
                    AssertionKind::Response,
                    format!("invalid pattern /{}/: {}", pattern, e),
                ),
            },
        );
    }

    results
}

/// Compare expected fields against a row
pub fn check_fields(entity: &str, expected: &Record, row: &Record) -> Vec<AssertionResult> {
    expected
        .iter()
        .map(|(field, want)| match row.get(field) {
            Some(got) if values_match(want, got) => AssertionResult::pass(
                AssertionKind::Field,
                format!("{}.{} = {}", entity, field, got),
            ),
            Some(got) => AssertionResult::fail(
                AssertionKind::Field,
                format!("{}.{}: expected {}, got {}", entity, field, want, got),
            ),
            None => AssertionResult::fail(
                AssertionKind::Field,
                format!("{}.{}: field missing, expected {}", entity, field, want),
            ),
        })
        .collect()
}

/// Loose JSON equality
///
/// Numbers compare numerically and a string compares equal to a number or
/// boolean with the same text, since stores disagree on column types.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::Number(_) | Value::Bool(_)) => *a == actual.to_string(),
        (Value::Number(_) | Value::Bool(_), Value::String(b)) => expected.to_string() == *b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(a), Value::Object(b)) => a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| values_match(v, other))),
        _ => expected == actual,
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calls() -> Vec<ToolCall> {
        vec![
            ToolCall::new("create_task", json!({"title": "milk", "priority": 2})),
            ToolCall::new("create_task", json!({"title": "eggs"})),
            ToolCall::new("search", json!({})),
        ]
    }

    #[test]
    fn test_tool_called() {
        let results = check_tools(&[ToolAssertion::called("search")], &calls());
        assert!(results[0].passed);

        let results = check_tools(&[ToolAssertion::called("delete_task")], &calls());
        assert!(!results[0].passed);
        assert!(results[0].message.contains("never called"));
    }

    #[test]
    fn test_tool_times_and_args() {
        let mut exact = ToolAssertion::called("create_task");
        exact.times = Some(2);
        assert!(check_tools(&[exact.clone()], &calls())[0].passed);
        exact.times = Some(1);
        assert!(!check_tools(&[exact], &calls())[0].passed);

        let mut with_args = ToolAssertion::called("create_task");
        with_args.args = json!({"title": "milk", "priority": "2"}).as_object().cloned();
        assert!(check_tools(&[with_args.clone()], &calls())[0].passed);
        with_args.args = json!({"title": "bread"}).as_object().cloned();
        assert!(!check_tools(&[with_args], &calls())[0].passed);
    }

    #[test]
    fn test_tool_not_called() {
        let mut not_called = ToolAssertion::called("search");
        not_called.called = false;
        assert!(!check_tools(&[not_called.clone()], &calls())[0].passed);
        assert!(check_tools(&[not_called], &[])[0].passed);
    }

    #[test]
    fn test_response_checks() {
        let assertion = ResponseAssertion {
            contains: vec!["CREATED".into()],
            not_contains: vec!["error".into()],
            matches: Some(r"task \w+".into()),
        };
        let results = check_response(&assertion, "I created the task milk");
        assert!(results.iter().all(|r| r.passed));

        let results = check_response(&assertion, "Something went wrong: error");
        assert_eq!(results.iter().filter(|r| !r.passed).count(), 3);

        let bad = ResponseAssertion {
            matches: Some("(".into()),
            ..Default::default()
        };
        let results = check_response(&bad, "text");
        assert!(!results[0].passed);
        assert!(results[0].message.contains("invalid pattern"));
    }

    #[test]
    fn test_values_match() {
        assert!(values_match(&json!(1), &json!(1.0)));
        assert!(values_match(&json!("true"), &json!(true)));
        assert!(values_match(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!values_match(&json!("x"), &json!("y")));
        assert!(!values_match(&json!([1, 2]), &json!([1])));
    }

    #[test]
    fn test_check_fields() {
        let row = json!({"title": "milk", "done": false}).as_object().cloned().unwrap();
        let expected = json!({"done": false, "owner": "u"}).as_object().cloned().unwrap();
        let results = check_fields("tasks", &expected, &row);
        assert!(results.iter().any(|r| r.passed));
        assert!(results.iter().any(|r| !r.passed && r.message.contains("missing")));
    }
}
