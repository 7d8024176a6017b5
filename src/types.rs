//! Core run-model entities.
//!
//! Everything a run owns is modeled here as typed values: the run itself,
//! its tasks, workers, per-attempt executions, step traces, evaluations,
//! events, and the optional skill-optimization session. The store encodes
//! and decodes these at its boundary; the orchestrator manipulates the
//! typed forms only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RunConfig;

/// Lifecycle status of a run.
///
/// Statuses form a DAG; the terminal set is sticky. Once terminal, only
/// another terminal transition (via the finalizer) is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Ingesting,
    GeneratingTasks,
    Running,
    Evaluating,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Returns true if this status is in the terminal set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Returns true if a transition from `self` to `next` is allowed.
    ///
    /// The allowed graph is the linear chain
    /// `queued → ingesting → generating_tasks → running → evaluating`
    /// with every non-terminal state able to jump to any terminal state,
    /// and terminal states able to move only to other terminal states
    /// (the finalizer is authoritative).
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return next.is_terminal();
        }
        if next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Ingesting)
                | (RunStatus::Ingesting, RunStatus::GeneratingTasks)
                | (RunStatus::GeneratingTasks, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Evaluating)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Queued => "queued",
            RunStatus::Ingesting => "ingesting",
            RunStatus::GeneratingTasks => "generating_tasks",
            RunStatus::Running => "running",
            RunStatus::Evaluating => "evaluating",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{}", name)
    }
}

/// Execution phase of a run. The optimized phase re-runs every task against
/// a retrieval index rebuilt with the generated skill document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Baseline,
    Optimized,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Baseline => write!(f, "baseline"),
            RunPhase::Optimized => write!(f, "optimized"),
        }
    }
}

/// A single evaluation run. Owns everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque run identifier.
    pub id: String,
    /// Base URL the documentation was ingested from.
    pub docs_url: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Immutable configuration captured at creation.
    pub config: RunConfig,
    /// Authoritative totals, written by the finalizer.
    pub totals: Option<PhaseTotals>,
    /// Accumulated model cost in USD. Monotonically non-decreasing.
    pub cost_estimate: f64,
}

impl Run {
    /// Creates a new queued run with a fresh identifier.
    pub fn new(docs_url: impl Into<String>, config: RunConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            docs_url: docs_url.into(),
            status: RunStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            config,
            totals: None,
            cost_estimate: 0.0,
        }
    }
}

/// Status of a task within one run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TaskStatus {
    /// Returns true if this status ends the task for the current phase.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Passed => "passed",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

/// A unit of work: a documented workflow to be accomplished using only
/// retrieved context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub run_id: String,
    pub name: String,
    pub description: String,
    /// Category slug (e.g. "authentication", "quickstart").
    pub category: String,
    /// Difficulty slug ("easy", "medium", "hard").
    pub difficulty: String,
    /// Phrases a complete answer is expected to cover.
    pub expected_signals: Vec<String>,
    pub status: TaskStatus,
}

impl Task {
    /// Creates a new pending task for a run.
    pub fn new(
        run_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        difficulty: impl Into<String>,
        expected_signals: Vec<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            name: name.into(),
            description: description.into(),
            category: category.into(),
            difficulty: difficulty.into(),
            expected_signals,
            status: TaskStatus::Pending,
        }
    }
}

/// Status of a worker activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Done => "done",
            WorkerStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Per-worker overrides for model sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A model-backed worker provisioned for a run.
///
/// Labels are unique within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub run_id: String,
    pub worker_label: String,
    pub model_provider: String,
    pub model_name: String,
    pub model_config: ModelOverrides,
    pub status: WorkerStatus,
}

/// Why a task execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    StepLimit,
    TokenLimit,
    CostLimit,
    Cancelled,
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::Completed => "completed",
            StopReason::StepLimit => "step_limit",
            StopReason::TokenLimit => "token_limit",
            StopReason::CostLimit => "cost_limit",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One attempt of a task by a worker within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub phase: RunPhase,
    pub status: TaskStatus,
    pub step_count: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
    pub stop_reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    /// Creates a new running execution for a (task, worker, phase) triple.
    pub fn new(
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        phase: RunPhase,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            phase,
            status: TaskStatus::Running,
            step_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_estimate: 0.0,
            stop_reason: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// An item on the agent's working plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub text: String,
    pub done: bool,
}

impl PlanItem {
    pub fn pending(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }
}

/// Budget remaining for an execution, recomputed after each model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RemainingBudget {
    pub steps: u32,
    pub tokens: u64,
}

/// Self-referential memory for one task execution. Upserted after each
/// iteration; the owning worker is the sole mutator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMemoryState {
    pub task_execution_id: String,
    pub current_step: u32,
    pub goal: String,
    pub plan: Vec<PlanItem>,
    pub visited_sources: Vec<String>,
    pub facts: Vec<String>,
    pub step_summaries: Vec<String>,
    pub remaining_budget: RemainingBudget,
}

impl AgentMemoryState {
    /// Creates empty memory for an execution with the given goal.
    pub fn new(task_execution_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            task_execution_id: task_execution_id.into(),
            current_step: 0,
            goal: goal.into(),
            plan: Vec::new(),
            visited_sources: Vec::new(),
            facts: Vec::new(),
            step_summaries: Vec::new(),
            remaining_budget: RemainingBudget::default(),
        }
    }
}

/// One of the four phases of one agent-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Retrieve,
    Plan,
    Act,
    Reflect,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepPhase::Retrieve => "retrieve",
            StepPhase::Plan => "plan",
            StepPhase::Act => "act",
            StepPhase::Reflect => "reflect",
        };
        write!(f, "{}", name)
    }
}

/// A reference to a retrieved chunk, recorded on retrieve and act steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub source_url: String,
    pub snippet_hash: String,
    pub score: f64,
}

/// A citation produced by the agent's act phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub snippet_hash: Option<String>,
    pub excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<u32>,
}

/// Typed content of one step trace, tagged by agent-loop phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StepRecord {
    Retrieve {
        query: String,
        chunks: Vec<ChunkRef>,
    },
    Plan {
        plan_items: Vec<String>,
        rationale: String,
    },
    Act {
        answer: String,
        step_output: String,
        citations: Vec<Citation>,
        chunks_used: Vec<ChunkRef>,
        done: bool,
        done_reason: Option<String>,
        discovered_facts: Vec<String>,
    },
    Reflect {
        should_continue: bool,
        summary: String,
        plan_updates: Vec<String>,
        confidence: f64,
        stop_reason: Option<String>,
    },
}

impl StepRecord {
    /// Returns the agent-loop phase this record belongs to.
    pub fn phase(&self) -> StepPhase {
        match self {
            StepRecord::Retrieve { .. } => StepPhase::Retrieve,
            StepRecord::Plan { .. } => StepPhase::Plan,
            StepRecord::Act { .. } => StepPhase::Act,
            StepRecord::Reflect { .. } => StepPhase::Reflect,
        }
    }
}

/// Token usage and latency for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
    pub latency_ms: u64,
}

/// One persisted phase of one iteration of the agent loop.
///
/// Steps are strictly ordered by `(task_execution_id, id)`; `step_index`
/// is shared by the four phases of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    /// Dense insertion id, assigned by the store.
    pub id: i64,
    pub task_execution_id: String,
    pub step_index: u32,
    pub record: StepRecord,
    pub usage: Option<CallUsage>,
    pub created_at: DateTime<Utc>,
}

/// Result of one deterministic check over an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterministicCheck {
    pub name: String,
    pub passed: bool,
    pub score_delta: f64,
    pub details: Option<String>,
}

/// The final answer an execution produced, with its steps and citations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub answer: String,
    pub steps: Vec<String>,
    pub citations: Vec<Citation>,
}

/// Rubric criterion scores, each in `[0, 10]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CriterionScores {
    pub completeness: f64,
    pub correctness: f64,
    pub groundedness: f64,
    pub actionability: f64,
}

impl CriterionScores {
    /// Mean of the four criteria.
    pub fn average(&self) -> f64 {
        (self.completeness + self.correctness + self.groundedness + self.actionability) / 4.0
    }

    /// Clamps every criterion into `[0, 10]`.
    pub fn clamped(mut self) -> Self {
        self.completeness = self.completeness.clamp(0.0, 10.0);
        self.correctness = self.correctness.clamp(0.0, 10.0);
        self.groundedness = self.groundedness.clamp(0.0, 10.0);
        self.actionability = self.actionability.clamp(0.0, 10.0);
        self
    }
}

/// Categorical diagnosis of why a task failed. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    MissingContent,
    OutdatedContent,
    IncorrectContent,
    AmbiguousInstructions,
    MissingExamples,
    BrokenLinks,
    InsufficientDetail,
    PoorStructure,
}

impl FailureClass {
    /// All allowed values, used to validate judge suggestions.
    pub const ALL: [FailureClass; 8] = [
        FailureClass::MissingContent,
        FailureClass::OutdatedContent,
        FailureClass::IncorrectContent,
        FailureClass::AmbiguousInstructions,
        FailureClass::MissingExamples,
        FailureClass::BrokenLinks,
        FailureClass::InsufficientDetail,
        FailureClass::PoorStructure,
    ];

    /// Parses a snake_case slug into a failure class, if it is in the set.
    pub fn parse(slug: &str) -> Option<FailureClass> {
        match slug {
            "missing_content" => Some(FailureClass::MissingContent),
            "outdated_content" => Some(FailureClass::OutdatedContent),
            "incorrect_content" => Some(FailureClass::IncorrectContent),
            "ambiguous_instructions" => Some(FailureClass::AmbiguousInstructions),
            "missing_examples" => Some(FailureClass::MissingExamples),
            "broken_links" => Some(FailureClass::BrokenLinks),
            "insufficient_detail" => Some(FailureClass::InsufficientDetail),
            "poor_structure" => Some(FailureClass::PoorStructure),
            _ => None,
        }
    }

    /// Snake_case slug for this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::MissingContent => "missing_content",
            FailureClass::OutdatedContent => "outdated_content",
            FailureClass::IncorrectContent => "incorrect_content",
            FailureClass::AmbiguousInstructions => "ambiguous_instructions",
            FailureClass::MissingExamples => "missing_examples",
            FailureClass::BrokenLinks => "broken_links",
            FailureClass::InsufficientDetail => "insufficient_detail",
            FailureClass::PoorStructure => "poor_structure",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The verdict of the two-stage evaluation pipeline for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvaluation {
    pub run_id: String,
    pub task_id: String,
    pub phase: RunPhase,
    pub criterion_scores: CriterionScores,
    pub average_score: f64,
    /// `quality_pass && validity_pass`.
    pub pass: bool,
    /// Rubric average at or above threshold.
    pub quality_pass: bool,
    /// Grounded in evidence with no deterministic blocks.
    pub validity_pass: bool,
    pub validity_blocked_reasons: Vec<String>,
    pub failure_class: Option<FailureClass>,
    pub rationale: String,
    pub judge_model: String,
    pub confidence: f64,
}

/// A single entry in the run's totally-ordered event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Dense global insertion id. Consumers cursor by this, not by `seq`.
    pub id: i64,
    pub run_id: String,
    /// Dense per-run sequence number, unique within the run.
    pub seq: i64,
    /// Dot-notation event type, e.g. `task.step.created`.
    pub event_type: String,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

/// Payload attached to every run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Scope of a persisted run error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunErrorScope {
    RunFatal,
    TaskExecutionError,
    SkillOptimizationError,
}

impl std::fmt::Display for RunErrorScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunErrorScope::RunFatal => "RUN_FATAL",
            RunErrorScope::TaskExecutionError => "TASK_EXECUTION_ERROR",
            RunErrorScope::SkillOptimizationError => "SKILL_OPTIMIZATION_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// An error recorded against a run for post-hoc inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunErrorRecord {
    pub run_id: String,
    pub scope: RunErrorScope,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl RunErrorRecord {
    pub fn new(
        run_id: impl Into<String>,
        scope: RunErrorScope,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scope,
            message: message.into(),
            data: None,
            created_at: Utc::now(),
        }
    }
}

/// Aggregated totals for one phase of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTotals {
    pub total_tasks: u32,
    pub passed_tasks: u32,
    pub failed_tasks: u32,
    pub pass_rate: f64,
    pub quality_passed_tasks: u32,
    pub quality_pass_rate: f64,
    pub validity_passed_tasks: u32,
    pub validity_pass_rate: f64,
    pub average_score: f64,
    pub failure_breakdown: BTreeMap<String, u32>,
}

/// Component-wise `optimized − baseline` comparison, rounded to 4 decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalsDelta {
    pub pass_rate_delta: f64,
    pub average_score_delta: f64,
    pub passed_tasks_delta: i64,
    pub failed_tasks_delta: i64,
}

/// Status of a skill-optimization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Error,
}

/// Where the pre-optimization skill document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillOrigin {
    SiteSkill,
    None,
}

/// The baseline/optimized comparison session. Exactly one per run when
/// skill optimization is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillOptimizationSession {
    pub run_id: String,
    pub status: SessionStatus,
    pub source_skill_origin: SkillOrigin,
    pub baseline_totals: Option<PhaseTotals>,
    pub optimized_totals: Option<PhaseTotals>,
    pub delta: Option<TotalsDelta>,
    pub error_message: Option<String>,
}

impl SkillOptimizationSession {
    /// Creates a pending session for a run.
    pub fn new(run_id: impl Into<String>, origin: SkillOrigin) -> Self {
        Self {
            run_id: run_id.into(),
            status: SessionStatus::Pending,
            source_skill_origin: origin,
            baseline_totals: None,
            optimized_totals: None,
            delta: None,
            error_message: None,
        }
    }
}
