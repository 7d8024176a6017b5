//! Persistent storage interface.
//!
//! The orchestrator manipulates typed values only; each `Store`
//! implementation owns the encode/decode boundary. Two implementations
//! ship: an in-memory store for tests and single-process deployments, and
//! a Postgres store for anything that outlives the process.
//!
//! # Write fencing
//!
//! Once a run is finalized (`completed` or `failed`), writes to its
//! executions, steps, and evaluations are rejected with
//! [`StoreError::RunClosed`]. Step inserts are additionally rejected for
//! `canceled` runs so cancellation is live: after `cancel` lands, no new
//! `task.step.created` can be appended, while the cancellation path can
//! still finalize executions as skipped and record partial results.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

use crate::ingest::Artifact;
use crate::types::{
    AgentMemoryState, CallUsage, Citation, DeterministicCheck, EventPayload, PhaseTotals, Run,
    RunEvent, RunErrorRecord, RunPhase, RunStatus, SkillOptimizationSession, StepRecord, StepTrace,
    StopReason, Task, TaskAttempt, TaskEvaluation, TaskExecution, TaskStatus, Worker, WorkerStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The run is terminal and no longer accepts this write.
    #[error("Run '{run_id}' is closed for writes")]
    RunClosed { run_id: String },

    /// A uniqueness conflict that survived bounded retries.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Encode/decode failure at the storage boundary.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Entity operations the orchestrator depends on.
#[async_trait]
pub trait Store: Send + Sync {
    // -- runs ---------------------------------------------------------------

    /// Inserts a new run.
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Fetches a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// Applies a status transition if the state machine allows it.
    ///
    /// Returns `Ok(false)` without writing when the transition is not
    /// allowed — in particular, any transition away from a terminal state
    /// is a no-op because the finalizer is authoritative.
    async fn update_run_status(&self, run_id: &str, status: RunStatus)
        -> Result<bool, StoreError>;

    /// Finalizes a run: terminal status, totals, `ended_at`, and every
    /// non-terminal worker flipped to done.
    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        totals: Option<PhaseTotals>,
    ) -> Result<(), StoreError>;

    /// Atomically adds `delta` to the run's cost estimate and returns the
    /// new total.
    async fn increment_run_cost(&self, run_id: &str, delta: f64) -> Result<f64, StoreError>;

    /// Returns true if the run has been canceled.
    async fn is_run_canceled(&self, run_id: &str) -> Result<bool, StoreError>;

    // -- artifacts ----------------------------------------------------------

    /// Persists the artifacts produced by ingestion.
    async fn persist_ingestion_artifacts(
        &self,
        run_id: &str,
        artifacts: &[Artifact],
    ) -> Result<(), StoreError>;

    /// Fetches a run's ingested artifacts.
    async fn get_run_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>, StoreError>;

    // -- tasks --------------------------------------------------------------

    /// Persists the synthesized task list.
    async fn persist_tasks(&self, tasks: &[Task]) -> Result<(), StoreError>;

    /// Lists a run's tasks in synthesis order.
    async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Updates one task's phase-scoped status.
    async fn update_task_status(
        &self,
        run_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError>;

    // -- workers ------------------------------------------------------------

    /// Provisions workers for a run. Idempotent: if the run already has
    /// workers, the existing set is returned unchanged.
    async fn ensure_run_workers(
        &self,
        run_id: &str,
        workers: &[Worker],
    ) -> Result<Vec<Worker>, StoreError>;

    /// Updates one worker's status.
    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError>;

    /// Lists a run's workers.
    async fn list_workers(&self, run_id: &str) -> Result<Vec<Worker>, StoreError>;

    // -- executions ---------------------------------------------------------

    /// Inserts a new task execution.
    async fn create_task_execution(&self, execution: &TaskExecution) -> Result<(), StoreError>;

    /// Overwrites an execution's progress counters.
    async fn update_task_execution_progress(
        &self,
        execution_id: &str,
        step_count: u32,
        tokens_in: u64,
        tokens_out: u64,
        cost_estimate: f64,
    ) -> Result<(), StoreError>;

    /// Marks an execution terminal with its stop reason.
    async fn finalize_task_execution(
        &self,
        execution_id: &str,
        status: TaskStatus,
        stop_reason: Option<StopReason>,
    ) -> Result<(), StoreError>;

    /// Lists every execution of a run in creation order.
    async fn list_task_executions(&self, run_id: &str) -> Result<Vec<TaskExecution>, StoreError>;

    // -- agent memory and step traces ---------------------------------------

    /// Upserts the agent memory row for an execution (last writer wins).
    async fn upsert_task_agent_state(&self, state: &AgentMemoryState) -> Result<(), StoreError>;

    /// Fetches an execution's agent memory, if any.
    async fn get_task_agent_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<AgentMemoryState>, StoreError>;

    /// Appends one step trace and returns its dense insertion id.
    ///
    /// Rejected with [`StoreError::RunClosed`] once the owning run is
    /// terminal.
    async fn persist_task_step(
        &self,
        execution_id: &str,
        step_index: u32,
        record: &StepRecord,
        usage: Option<CallUsage>,
    ) -> Result<i64, StoreError>;

    /// Persists the citations attached to one act step.
    async fn persist_task_step_citations(
        &self,
        step_id: i64,
        citations: &[Citation],
    ) -> Result<(), StoreError>;

    /// Lists an execution's steps ordered by insertion id.
    async fn list_task_steps(&self, execution_id: &str) -> Result<Vec<StepTrace>, StoreError>;

    // -- evaluation artifacts -----------------------------------------------

    /// Persists the deterministic check results for an execution.
    async fn persist_deterministic_checks(
        &self,
        execution_id: &str,
        checks: &[DeterministicCheck],
    ) -> Result<(), StoreError>;

    /// Lists an execution's persisted check results.
    async fn list_deterministic_checks(
        &self,
        execution_id: &str,
    ) -> Result<Vec<DeterministicCheck>, StoreError>;

    /// Persists the final attempt an execution produced.
    async fn persist_task_attempt(
        &self,
        execution_id: &str,
        attempt: &TaskAttempt,
    ) -> Result<(), StoreError>;

    /// Persists one task evaluation.
    async fn persist_task_evaluation(&self, evaluation: &TaskEvaluation)
        -> Result<(), StoreError>;

    /// Lists a run's evaluations for one phase.
    async fn list_task_evaluations(
        &self,
        run_id: &str,
        phase: RunPhase,
    ) -> Result<Vec<TaskEvaluation>, StoreError>;

    // -- event log ----------------------------------------------------------

    /// Appends one event. `seq` is dense and unique per run; the returned
    /// event carries the globally-ordered insertion id consumers cursor by.
    /// Durable before returning.
    async fn append_run_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &EventPayload,
    ) -> Result<RunEvent, StoreError>;

    /// Reads events with `id > after_id` in id order, up to `limit`.
    async fn get_run_events_after(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RunEvent>, StoreError>;

    // -- run errors ---------------------------------------------------------

    /// Records a run-scoped error for post-hoc inspection.
    async fn persist_run_error(&self, error: &RunErrorRecord) -> Result<(), StoreError>;

    /// Lists a run's recorded errors in insertion order.
    async fn list_run_errors(&self, run_id: &str) -> Result<Vec<RunErrorRecord>, StoreError>;

    // -- skill optimization -------------------------------------------------

    /// Inserts or replaces the run's optimization session.
    async fn upsert_skill_session(
        &self,
        session: &SkillOptimizationSession,
    ) -> Result<(), StoreError>;

    /// Fetches the run's optimization session, if any.
    async fn get_skill_session(
        &self,
        run_id: &str,
    ) -> Result<Option<SkillOptimizationSession>, StoreError>;

    /// Persists a generated skill document keyed by its content hash.
    async fn save_skill_artifact(
        &self,
        run_id: &str,
        content_hash: &str,
        markdown: &str,
    ) -> Result<(), StoreError>;
}
