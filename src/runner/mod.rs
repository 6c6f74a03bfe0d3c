//! Scenario execution
//!
//! The step executor runs single steps, the sequential runner drives one
//! scenario, and the parallel and multi-run orchestrators build on top of it.
//! Every report produced here is plain data for external renderers.

pub mod assertions;
pub mod context;
pub mod hallucination;
pub mod isolation;
pub mod multi_run;
pub mod parallel;
pub mod report;
pub mod sequential;
pub mod stats;
pub mod step;

pub use context::{ExecutionContext, UsageTotals};
pub use hallucination::{ClaimPredicate, HallucinationDetector, HallucinationOccurrence, KeywordClaim};
pub use isolation::UserIsolationManager;
pub use multi_run::{AggregatedScenarioReport, MultiRunOptions, MultiRunner, ScenarioStats, StepStats};
pub use parallel::{ParallelOptions, ParallelRunSummary, ParallelRunner};
pub use report::{
    AssertionKind, AssertionResult, ScenarioReport, ScenarioStatus, StepOutput, StepReport,
    StepState, StepStatus,
};
pub use sequential::{RunOptions, ScenarioRunner, TargetStep};
pub use stats::Stats;
pub use step::{ExecutorConfig, StepExecutor};
