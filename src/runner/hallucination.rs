//! Claimed-but-unperformed action detection
//!
//! A chat step "hallucinates" when its reply claims an action happened while
//! the tool-call evidence for that step does not back it up.

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::common::config::HallucinationConfig;
use crate::common::{Error, Result};
use crate::scenario::StepKind;

use super::report::{AssertionKind, StepReport};

/// Decides whether a reply claims that an action was performed
pub trait ClaimPredicate: Send + Sync {
    fn name(&self) -> &str;

    /// The matched claim, if the text makes one
    fn claims_action(&self, text: &str) -> Option<String>;
}

/// Whole-word, case-insensitive keyword match
#[derive(Debug, Clone)]
pub struct KeywordClaim {
    keyword: String,
    pattern: Regex,
}

impl KeywordClaim {
    pub fn new(keyword: &str) -> Result<Self> {
        let pattern = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(keyword)))
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Config(format!("invalid hallucination keyword '{}': {}", keyword, e)))?;
        Ok(Self {
            keyword: keyword.to_string(),
            pattern,
        })
    }
}

impl ClaimPredicate for KeywordClaim {
    fn name(&self) -> &str {
        &self.keyword
    }

    fn claims_action(&self, text: &str) -> Option<String> {
        self.pattern.find(text).map(|m| m.as_str().to_string())
    }
}

/// One detected hallucination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HallucinationOccurrence {
    /// Zero-based run number
    pub run: usize,
    pub step_index: usize,
    /// Text that made the claim
    pub claim: String,
    pub excerpt: String,
}

pub struct HallucinationDetector {
    predicates: Vec<Box<dyn ClaimPredicate>>,
}

impl HallucinationDetector {
    pub fn new(predicates: Vec<Box<dyn ClaimPredicate>>) -> Self {
        Self { predicates }
    }

    pub fn from_config(config: &HallucinationConfig) -> Result<Self> {
        let predicates = config
            .keywords
            .iter()
            .map(|k| KeywordClaim::new(k).map(|p| Box::new(p) as Box<dyn ClaimPredicate>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(predicates))
    }

    /// Check one step of one run
    ///
    /// Only chat steps are considered. A failed tool-call assertion covers
    /// both a wrong call and an expected call that never happened.
    pub fn detect(&self, run: usize, step: &StepReport) -> Option<HallucinationOccurrence> {
        if step.kind != StepKind::Chat {
            return None;
        }
        let text = step.response_text()?;
        let tool_failed = step
            .failed_assertions()
            .any(|a| a.kind == AssertionKind::ToolCall);
        if !tool_failed {
            return None;
        }

        let claim = self.predicates.iter().find_map(|p| p.claims_action(text))?;
        tracing::debug!(run, step = step.index, claim = %claim, "Possible hallucination");
        Some(HallucinationOccurrence {
            run,
            step_index: step.index,
            claim,
            excerpt: excerpt(text),
        })
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() > 160 {
        format!("{}...", text.chars().take(160).collect::<String>())
    } else {
        text.to_string()
    }
}
