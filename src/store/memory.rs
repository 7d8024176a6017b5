//! In-memory store for tests and single-process deployments.
//!
//! One mutex guards all tables; the event seq allocator therefore hands
//! out dense per-run sequence numbers by construction. The write fencing
//! described on the [`Store`](super::Store) trait is enforced here exactly
//! as in the Postgres store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::ingest::Artifact;
use crate::types::{
    AgentMemoryState, CallUsage, Citation, DeterministicCheck, EventPayload, PhaseTotals, Run,
    RunEvent, RunErrorRecord, RunPhase, RunStatus, SkillOptimizationSession, StepRecord, StepTrace,
    StopReason, Task, TaskAttempt, TaskEvaluation, TaskExecution, TaskStatus, Worker, WorkerStatus,
};

use super::{Store, StoreError};

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, Run>,
    artifacts: HashMap<String, Vec<Artifact>>,
    tasks: HashMap<String, Vec<Task>>,
    workers: HashMap<String, Vec<Worker>>,
    executions: Vec<TaskExecution>,
    agent_states: HashMap<String, AgentMemoryState>,
    steps: Vec<StepTrace>,
    next_step_id: i64,
    citations: HashMap<i64, Vec<Citation>>,
    checks: HashMap<String, Vec<DeterministicCheck>>,
    attempts: HashMap<String, TaskAttempt>,
    evaluations: Vec<TaskEvaluation>,
    events: Vec<RunEvent>,
    next_event_id: i64,
    run_seq: HashMap<String, i64>,
    run_errors: Vec<RunErrorRecord>,
    sessions: HashMap<String, SkillOptimizationSession>,
    skill_artifacts: HashMap<String, (String, String)>,
}

impl MemoryInner {
    fn run(&self, run_id: &str) -> Result<&Run, StoreError> {
        self.runs
            .get(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run_id)))
    }

    fn execution(&self, execution_id: &str) -> Result<&TaskExecution, StoreError> {
        self.executions
            .iter()
            .find(|e| e.id == execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", execution_id)))
    }

    /// Rejects execution-scoped writes once the run is finalized.
    fn guard_execution_write(&self, execution_id: &str) -> Result<String, StoreError> {
        let run_id = self.execution(execution_id)?.run_id.clone();
        let status = self.run(&run_id)?.status;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed { run_id });
        }
        Ok(run_id)
    }
}

/// In-process implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' exists", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        Ok(self.lock().run(run_id)?.clone())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let current = inner.run(run_id)?.status;
        // Terminal rewrites belong to the finalizer; everything else goes
        // through the transition DAG.
        if current.is_terminal() || !current.can_transition_to(status) {
            return Ok(false);
        }
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.status = status;
        }
        Ok(true)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        totals: Option<PhaseTotals>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.run(run_id)?;
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.status = status;
            run.totals = totals;
            run.ended_at = Some(Utc::now());
        }
        if let Some(workers) = inner.workers.get_mut(run_id) {
            for worker in workers.iter_mut() {
                if !matches!(worker.status, WorkerStatus::Done | WorkerStatus::Error) {
                    worker.status = WorkerStatus::Done;
                }
            }
        }
        Ok(())
    }

    async fn increment_run_cost(&self, run_id: &str, delta: f64) -> Result<f64, StoreError> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run_id)))?;
        run.cost_estimate += delta;
        Ok(run.cost_estimate)
    }

    async fn is_run_canceled(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().run(run_id)?.status == RunStatus::Canceled)
    }

    async fn persist_ingestion_artifacts(
        &self,
        run_id: &str,
        artifacts: &[Artifact],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.run(run_id)?;
        inner.artifacts.insert(run_id.to_string(), artifacts.to_vec());
        Ok(())
    }

    async fn get_run_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>, StoreError> {
        Ok(self.lock().artifacts.get(run_id).cloned().unwrap_or_default())
    }

    async fn persist_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for task in tasks {
            inner
                .tasks
                .entry(task.run_id.clone())
                .or_default()
                .push(task.clone());
        }
        Ok(())
    }

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self.lock().tasks.get(run_id).cloned().unwrap_or_default())
    }

    async fn update_task_status(
        &self,
        run_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tasks = inner
            .tasks
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("tasks for run '{}'", run_id)))?;
        let task = tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task '{}'", task_id)))?;
        task.status = status;
        Ok(())
    }

    async fn ensure_run_workers(
        &self,
        run_id: &str,
        workers: &[Worker],
    ) -> Result<Vec<Worker>, StoreError> {
        let mut inner = self.lock();
        inner.run(run_id)?;
        if let Some(existing) = inner.workers.get(run_id) {
            if !existing.is_empty() {
                return Ok(existing.clone());
            }
        }
        inner.workers.insert(run_id.to_string(), workers.to_vec());
        Ok(workers.to_vec())
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for workers in inner.workers.values_mut() {
            if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
                worker.status = status;
                return Ok(());
            }
        }
        Err(StoreError::NotFound(format!("worker '{}'", worker_id)))
    }

    async fn list_workers(&self, run_id: &str) -> Result<Vec<Worker>, StoreError> {
        Ok(self.lock().workers.get(run_id).cloned().unwrap_or_default())
    }

    async fn create_task_execution(&self, execution: &TaskExecution) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let status = inner.run(&execution.run_id)?.status;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed {
                run_id: execution.run_id.clone(),
            });
        }
        inner.executions.push(execution.clone());
        Ok(())
    }

    async fn update_task_execution_progress(
        &self,
        execution_id: &str,
        step_count: u32,
        tokens_in: u64,
        tokens_out: u64,
        cost_estimate: f64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.guard_execution_write(execution_id)?;
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", execution_id)))?;
        execution.step_count = step_count;
        execution.tokens_in = tokens_in;
        execution.tokens_out = tokens_out;
        execution.cost_estimate = cost_estimate;
        Ok(())
    }

    async fn finalize_task_execution(
        &self,
        execution_id: &str,
        status: TaskStatus,
        stop_reason: Option<StopReason>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.guard_execution_write(execution_id)?;
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", execution_id)))?;
        execution.status = status;
        execution.stop_reason = stop_reason;
        execution.ended_at = Some(Utc::now());
        Ok(())
    }

    async fn list_task_executions(&self, run_id: &str) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn upsert_task_agent_state(&self, state: &AgentMemoryState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.guard_execution_write(&state.task_execution_id)?;
        inner
            .agent_states
            .insert(state.task_execution_id.clone(), state.clone());
        Ok(())
    }

    async fn get_task_agent_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<AgentMemoryState>, StoreError> {
        Ok(self.lock().agent_states.get(execution_id).cloned())
    }

    async fn persist_task_step(
        &self,
        execution_id: &str,
        step_index: u32,
        record: &StepRecord,
        usage: Option<CallUsage>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let run_id = inner.execution(execution_id)?.run_id.clone();
        // Step inserts are fenced on every terminal state so cancellation
        // is live (no new steps after cancel lands).
        if inner.run(&run_id)?.status.is_terminal() {
            return Err(StoreError::RunClosed { run_id });
        }
        inner.next_step_id += 1;
        let id = inner.next_step_id;
        inner.steps.push(StepTrace {
            id,
            task_execution_id: execution_id.to_string(),
            step_index,
            record: record.clone(),
            usage,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn persist_task_step_citations(
        &self,
        step_id: i64,
        citations: &[Citation],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.steps.iter().any(|s| s.id == step_id) {
            return Err(StoreError::NotFound(format!("step {}", step_id)));
        }
        inner.citations.insert(step_id, citations.to_vec());
        Ok(())
    }

    async fn list_task_steps(&self, execution_id: &str) -> Result<Vec<StepTrace>, StoreError> {
        let inner = self.lock();
        let mut steps: Vec<StepTrace> = inner
            .steps
            .iter()
            .filter(|s| s.task_execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    async fn persist_deterministic_checks(
        &self,
        execution_id: &str,
        checks: &[DeterministicCheck],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.guard_execution_write(execution_id)?;
        inner
            .checks
            .insert(execution_id.to_string(), checks.to_vec());
        Ok(())
    }

    async fn list_deterministic_checks(
        &self,
        execution_id: &str,
    ) -> Result<Vec<DeterministicCheck>, StoreError> {
        Ok(self.lock().checks.get(execution_id).cloned().unwrap_or_default())
    }

    async fn persist_task_attempt(
        &self,
        execution_id: &str,
        attempt: &TaskAttempt,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.guard_execution_write(execution_id)?;
        inner
            .attempts
            .insert(execution_id.to_string(), attempt.clone());
        Ok(())
    }

    async fn persist_task_evaluation(
        &self,
        evaluation: &TaskEvaluation,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let status = inner.run(&evaluation.run_id)?.status;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed {
                run_id: evaluation.run_id.clone(),
            });
        }
        inner.evaluations.push(evaluation.clone());
        Ok(())
    }

    async fn list_task_evaluations(
        &self,
        run_id: &str,
        phase: RunPhase,
    ) -> Result<Vec<TaskEvaluation>, StoreError> {
        Ok(self
            .lock()
            .evaluations
            .iter()
            .filter(|e| e.run_id == run_id && e.phase == phase)
            .cloned()
            .collect())
    }

    async fn append_run_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &EventPayload,
    ) -> Result<RunEvent, StoreError> {
        let mut inner = self.lock();
        inner.run(run_id)?;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let seq = inner.run_seq.entry(run_id.to_string()).or_insert(0);
        *seq += 1;
        let event = RunEvent {
            id,
            run_id: run_id.to_string(),
            seq: *seq,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn get_run_events_after(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RunEvent>, StoreError> {
        let inner = self.lock();
        let mut events: Vec<RunEvent> = inner
            .events
            .iter()
            .filter(|e| e.run_id == run_id && e.id > after_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        events.truncate(limit);
        Ok(events)
    }

    async fn persist_run_error(&self, error: &RunErrorRecord) -> Result<(), StoreError> {
        self.lock().run_errors.push(error.clone());
        Ok(())
    }

    async fn list_run_errors(&self, run_id: &str) -> Result<Vec<RunErrorRecord>, StoreError> {
        Ok(self
            .lock()
            .run_errors
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn upsert_skill_session(
        &self,
        session: &SkillOptimizationSession,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.run(&session.run_id)?;
        inner
            .sessions
            .insert(session.run_id.clone(), session.clone());
        Ok(())
    }

    async fn get_skill_session(
        &self,
        run_id: &str,
    ) -> Result<Option<SkillOptimizationSession>, StoreError> {
        Ok(self.lock().sessions.get(run_id).cloned())
    }

    async fn save_skill_artifact(
        &self,
        run_id: &str,
        content_hash: &str,
        markdown: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.run(run_id)?;
        inner.skill_artifacts.insert(
            run_id.to_string(),
            (content_hash.to_string(), markdown.to_string()),
        );
        Ok(())
    }
}
