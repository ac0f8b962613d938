//! Invocation options and the structured report.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use maestro_types::{CacheInfo, Tier, TokenUsage};

/// Per-invocation execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Budget cap in micro-units; `None` falls back to the workflow's
    /// default, and no cap at all means unlimited.
    pub budget_cap_micros: Option<u64>,
    /// Start every stage at this tier instead of its declared default.
    /// Escalation still moves strictly upward from here.
    pub initial_tier_override: Option<Tier>,
    /// Whether this invocation may read and write the response cache.
    pub enable_cache: bool,
    /// Whether this invocation writes ledger entries.
    pub enable_telemetry: bool,
    /// Overall wall-clock deadline, narrowed to each stage.
    pub deadline: Option<Duration>,
    /// Cooperative cancellation handle.
    pub cancel: CancellationToken,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            budget_cap_micros: None,
            initial_tier_override: None,
            enable_cache: true,
            enable_telemetry: true,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Terminal state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Never started (a required stage ahead of it failed).
    Pending,
    /// In flight; never appears in a finished report.
    Running,
    /// Produced an output.
    Completed,
    /// Terminal failure.
    Failed,
    /// Skipped because the budget could not cover its estimate.
    SkippedBudget,
    /// Invocation was cancelled before or during this stage.
    Cancelled,
}

/// A stage's terminal failure, normalized for the report.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    /// Error kind, e.g. `all_providers_failed` or `missing_input`.
    pub kind: String,
    /// Whether a fresh invocation could plausibly succeed.
    pub retriable: bool,
    /// Human-readable detail.
    pub detail: String,
}

/// Everything the engine knows about one stage after the invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Response text, when completed.
    pub output: Option<String>,
    /// Confidence parsed from structured output, when present.
    pub confidence: Option<f32>,
    /// Tier the final attempt ran at.
    pub tier_used: Option<Tier>,
    /// Tier of the first attempt, when the stage escalated.
    pub escalated_from: Option<Tier>,
    /// Dispatch attempts, escalations included.
    pub attempts: u32,
    /// Stage cost across attempts, in micro-units.
    pub cost_micros: u64,
    /// Token totals across attempts.
    pub tokens: TokenUsage,
    /// Cache disposition of the final attempt.
    pub cache: Option<CacheInfo>,
    /// Models attempted by the final dispatch, in order, ending with
    /// the one that served.
    pub fallback_chain: Vec<String>,
    /// Stable index for deterministic reporting inside parallel groups.
    pub group_index: usize,
    /// Failure detail, when failed.
    pub failure: Option<StageFailure>,
    /// Stage duration across attempts, in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// A stage that never ran.
    #[must_use]
    pub(crate) fn unstarted(name: &str, status: StageStatus, group_index: usize) -> Self {
        Self {
            name: name.into(),
            status,
            output: None,
            confidence: None,
            tier_used: None,
            escalated_from: None,
            attempts: 0,
            cost_micros: 0,
            tokens: TokenUsage::default(),
            cache: None,
            fallback_chain: Vec::new(),
            group_index,
            failure: None,
            duration_ms: 0,
        }
    }
}

/// How the invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Every required stage completed (optional stages may have been
    /// skipped or failed; see the stage list).
    Completed,
    /// A required stage failed; later stages did not run.
    Partial {
        /// Names of failed stages.
        failed: Vec<String>,
    },
    /// A required stage could not fit the budget.
    BudgetExceeded,
    /// The invocation was cancelled.
    Cancelled,
}

/// Per-invocation cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    /// Calls served from the cache.
    pub hits: u64,
    /// Calls that went to a provider.
    pub misses: u64,
}

/// The structured result of one invocation. This is the API boundary:
/// stage failures live here, not in `Result::Err`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    /// Unique invocation id.
    pub invocation_id: String,
    /// Workflow name.
    pub workflow: String,
    /// Terminal outcome.
    pub outcome: WorkflowOutcome,
    /// Stage results in declaration order.
    pub stages: Vec<StageResult>,
    /// Total cost in micro-units; never exceeds the cap.
    pub cost_micros: u64,
    /// Cache usage for this invocation.
    pub cache: CacheUsage,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl WorkflowReport {
    /// The named stage's result, if present.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Output text of a completed stage.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&str> {
        self.stage(name).and_then(|s| s.output.as_deref())
    }

    /// Completed stage outputs keyed by stage name.
    #[must_use]
    pub fn outputs(&self) -> HashMap<&str, &str> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .filter_map(|s| Some((s.name.as_str(), s.output.as_deref()?)))
            .collect()
    }
}
