//! Worker pool: bounded concurrent workers over a shared task queue.
//!
//! `min(execution_concurrency, workers)` activities each pop tasks from a
//! single-consumer-per-pop FIFO queue, drive the agent loop, and submit
//! finished attempts to the evaluator through a shared semaphore of
//! `judge_concurrency` permits so judge calls never consume execution
//! slots. The pool returns when the queue drains or cancellation is
//! observed between tasks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::agent::{AgentError, AgentLoop, AgentOutcome};
use crate::config::RunConfig;
use crate::eval::judge::RubricJudge;
use crate::eval::{run_guard_checks, GuardInput, GuardOutcome};
use crate::events::{emit, event_types};
use crate::llm::CostModel;
use crate::retrieval::RetrievalIndex;
use crate::store::{Store, StoreError};
use crate::types::{
    CriterionScores, FailureClass, RunErrorRecord, RunErrorScope, RunPhase, StopReason, Task,
    TaskEvaluation, TaskExecution, TaskStatus, Worker, WorkerStatus,
};

/// Errors that abort a worker activity.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker activity panicked: {0}")]
    Join(String),
}

/// FIFO queue with single-consumer-per-pop semantics: a popped task is
/// handed to exactly one worker.
pub struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    /// Creates a queue holding `tasks` in order.
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            inner: Mutex::new(tasks.into()),
        }
    }

    /// Pops the next task, or `None` when drained.
    pub fn pop(&self) -> Option<Task> {
        self.inner.lock().expect("task queue lock poisoned").pop_front()
    }

    /// Remaining tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("task queue lock poisoned").len()
    }

    /// Returns true when no tasks remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool of worker activities executing one phase of a run.
pub struct WorkerPool {
    store: Arc<dyn Store>,
    agent: Arc<AgentLoop>,
    judge: Arc<RubricJudge>,
    pricing: Arc<dyn CostModel>,
}

impl WorkerPool {
    /// Creates a pool over the shared collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<AgentLoop>,
        judge: Arc<RubricJudge>,
        pricing: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            store,
            agent,
            judge,
            pricing,
        }
    }

    /// Runs every queued task through the phase, returning when the queue
    /// drains or cancellation is observed.
    pub async fn run_phase(
        &self,
        run_id: &str,
        phase: RunPhase,
        config: &RunConfig,
        index: Arc<RetrievalIndex>,
        tasks: Vec<Task>,
        workers: Vec<Worker>,
    ) -> Result<(), PoolError> {
        if tasks.is_empty() || workers.is_empty() {
            return Ok(());
        }

        let queue = Arc::new(TaskQueue::new(tasks));
        let judge_gate = Arc::new(Semaphore::new(config.judge_concurrency));
        let activities = config.execution_concurrency.min(workers.len());

        info!(
            run_id = %run_id,
            phase = %phase,
            activities = activities,
            queued = queue.len(),
            "Worker pool starting"
        );

        let mut handles = Vec::with_capacity(activities);
        for worker in workers.into_iter().take(activities) {
            let activity = WorkerActivity {
                store: Arc::clone(&self.store),
                agent: Arc::clone(&self.agent),
                judge: Arc::clone(&self.judge),
                pricing: Arc::clone(&self.pricing),
                queue: Arc::clone(&queue),
                judge_gate: Arc::clone(&judge_gate),
                index: Arc::clone(&index),
                config: config.clone(),
                run_id: run_id.to_string(),
                phase,
                worker,
            };
            handles.push(tokio::spawn(async move { activity.run().await }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(run_id = %run_id, error = %e, "Worker activity failed");
                    return Err(e);
                }
                Err(e) => return Err(PoolError::Join(e.to_string())),
            }
        }

        Ok(())
    }
}

struct WorkerActivity {
    store: Arc<dyn Store>,
    agent: Arc<AgentLoop>,
    judge: Arc<RubricJudge>,
    pricing: Arc<dyn CostModel>,
    queue: Arc<TaskQueue>,
    judge_gate: Arc<Semaphore>,
    index: Arc<RetrievalIndex>,
    config: RunConfig,
    run_id: String,
    phase: RunPhase,
    worker: Worker,
}

impl WorkerActivity {
    async fn run(&self) -> Result<(), PoolError> {
        self.store
            .update_worker_status(&self.worker.id, WorkerStatus::Idle)
            .await?;
        emit(
            self.store.as_ref(),
            &self.run_id,
            event_types::WORKER_STARTED,
            Some(self.phase),
            format!("worker {} started", self.worker.worker_label),
            None,
        )
        .await?;

        loop {
            if self.store.is_run_canceled(&self.run_id).await? {
                info!(
                    worker = %self.worker.worker_label,
                    "Cancellation observed between tasks, exiting"
                );
                break;
            }

            let task = match self.queue.pop() {
                Some(task) => task,
                None => break,
            };

            self.store
                .update_worker_status(&self.worker.id, WorkerStatus::Running)
                .await?;
            self.process_task(task).await?;
            self.store
                .update_worker_status(&self.worker.id, WorkerStatus::Idle)
                .await?;
        }

        self.store
            .update_worker_status(&self.worker.id, WorkerStatus::Done)
            .await?;
        emit(
            self.store.as_ref(),
            &self.run_id,
            event_types::WORKER_STOPPED,
            Some(self.phase),
            format!("worker {} stopped", self.worker.worker_label),
            None,
        )
        .await?;

        Ok(())
    }

    async fn process_task(&self, task: Task) -> Result<(), PoolError> {
        // Cost cap observed before starting: skip without evaluating.
        let run = self.store.get_run(&self.run_id).await?;
        if run.cost_estimate >= self.config.hard_cost_cap_usd {
            self.skip_task(&task, StopReason::CostLimit).await?;
            return Ok(());
        }

        self.store
            .update_task_status(&self.run_id, &task.task_id, TaskStatus::Running)
            .await?;
        emit(
            self.store.as_ref(),
            &self.run_id,
            event_types::TASK_STARTED,
            Some(self.phase),
            format!("task '{}' started on {}", task.name, self.worker.worker_label),
            None,
        )
        .await?;

        let execution = TaskExecution::new(&self.run_id, &task.task_id, &self.worker.id, self.phase);
        self.store.create_task_execution(&execution).await?;

        match self
            .agent
            .run(&self.config, &self.index, &task, &self.worker, &execution)
            .await
        {
            Ok(outcome) => self.handle_outcome(&task, &execution, outcome).await,
            Err(e) => self.handle_execution_error(&task, &execution, &e).await,
        }
    }

    async fn handle_outcome(
        &self,
        task: &Task,
        execution: &TaskExecution,
        outcome: AgentOutcome,
    ) -> Result<(), PoolError> {
        match outcome.stop_reason {
            StopReason::Cancelled => {
                self.store
                    .finalize_task_execution(
                        &execution.id,
                        TaskStatus::Skipped,
                        Some(StopReason::Cancelled),
                    )
                    .await?;
                self.store
                    .update_task_status(&self.run_id, &task.task_id, TaskStatus::Skipped)
                    .await?;
                emit(
                    self.store.as_ref(),
                    &self.run_id,
                    event_types::TASK_SKIPPED,
                    Some(self.phase),
                    format!("task '{}' skipped: cancelled", task.name),
                    None,
                )
                .await?;
                Ok(())
            }
            StopReason::CostLimit => {
                // Cost-capped mid-execution: skipped, never evaluated.
                self.store
                    .finalize_task_execution(
                        &execution.id,
                        TaskStatus::Skipped,
                        Some(StopReason::CostLimit),
                    )
                    .await?;
                self.store
                    .update_task_status(&self.run_id, &task.task_id, TaskStatus::Skipped)
                    .await?;
                emit(
                    self.store.as_ref(),
                    &self.run_id,
                    event_types::TASK_SKIPPED,
                    Some(self.phase),
                    format!("task '{}' skipped: cost cap reached", task.name),
                    None,
                )
                .await?;
                Ok(())
            }
            StopReason::Completed
            | StopReason::StepLimit
            | StopReason::TokenLimit
            | StopReason::Error => self.evaluate_attempt(task, execution, outcome).await,
        }
    }

    async fn evaluate_attempt(
        &self,
        task: &Task,
        execution: &TaskExecution,
        outcome: AgentOutcome,
    ) -> Result<(), PoolError> {
        self.store
            .persist_task_attempt(&execution.id, &outcome.attempt)
            .await?;

        let guard = run_guard_checks(&GuardInput {
            task,
            attempt: &outcome.attempt,
            step_count: outcome.step_count,
            stop_reason: outcome.stop_reason,
            index: &self.index,
        });
        self.store
            .persist_deterministic_checks(&execution.id, &guard.checks)
            .await?;

        let verdict = {
            let _permit = self
                .judge_gate
                .acquire()
                .await
                .expect("judge semaphore never closed");
            self.judge
                .evaluate(
                    &self.run_id,
                    task,
                    self.phase,
                    &outcome.attempt,
                    &guard,
                    &outcome.evidence,
                )
                .await
        };

        match verdict {
            Ok(judged) => {
                // Judge usage counts against the execution so run cost
                // stays the sum of execution costs.
                let judge_cost = self.pricing.call_cost_usd(&judged.usage);
                self.store
                    .update_task_execution_progress(
                        &execution.id,
                        outcome.step_count,
                        outcome.tokens_in + judged.usage.input_tokens,
                        outcome.tokens_out + judged.usage.output_tokens,
                        outcome.cost_estimate + judge_cost,
                    )
                    .await?;
                self.store
                    .increment_run_cost(&self.run_id, judge_cost)
                    .await?;

                let evaluation = judged.evaluation;
                self.store.persist_task_evaluation(&evaluation).await?;

                let status = if evaluation.pass {
                    TaskStatus::Passed
                } else {
                    TaskStatus::Failed
                };
                self.store
                    .finalize_task_execution(&execution.id, status, Some(outcome.stop_reason))
                    .await?;
                self.store
                    .update_task_status(&self.run_id, &task.task_id, status)
                    .await?;

                emit(
                    self.store.as_ref(),
                    &self.run_id,
                    event_types::TASK_EXECUTION_COMPLETED,
                    Some(self.phase),
                    format!("task '{}' evaluated", task.name),
                    Some(serde_json::json!({
                        "task_id": task.task_id,
                        "pass": evaluation.pass,
                        "average_score": evaluation.average_score,
                        "failure_class": evaluation.failure_class.map(|c| c.to_string()),
                    })),
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                warn!(
                    task_id = %task.task_id,
                    error = %e,
                    "Judge failed, recording fallback evaluation"
                );
                self.record_fallback(task, execution, &guard, &e.to_string())
                    .await
            }
        }
    }

    async fn handle_execution_error(
        &self,
        task: &Task,
        execution: &TaskExecution,
        error: &AgentError,
    ) -> Result<(), PoolError> {
        warn!(
            task_id = %task.task_id,
            worker = %self.worker.worker_label,
            error = %error,
            "Task execution failed"
        );
        self.record_fallback(task, execution, &GuardOutcome::default(), &error.to_string())
            .await
    }

    /// Per-task errors never fail the run: a fallback evaluation is
    /// persisted, the execution finalizes as error, and the pool moves on.
    async fn record_fallback(
        &self,
        task: &Task,
        execution: &TaskExecution,
        guard: &GuardOutcome,
        message: &str,
    ) -> Result<(), PoolError> {
        let mut blocked = guard.validity_blocked_reasons.clone();
        blocked.push("execution_error".to_string());

        let evaluation = TaskEvaluation {
            run_id: self.run_id.clone(),
            task_id: task.task_id.clone(),
            phase: self.phase,
            criterion_scores: CriterionScores::default(),
            average_score: 0.0,
            pass: false,
            quality_pass: false,
            validity_pass: false,
            validity_blocked_reasons: blocked,
            failure_class: Some(FailureClass::PoorStructure),
            rationale: format!("execution error: {}", message),
            judge_model: self.config.judge_model.clone(),
            confidence: 0.0,
        };
        self.store.persist_task_evaluation(&evaluation).await?;
        self.store
            .finalize_task_execution(&execution.id, TaskStatus::Error, Some(StopReason::Error))
            .await?;
        self.store
            .update_task_status(&self.run_id, &task.task_id, TaskStatus::Error)
            .await?;

        let error = RunErrorRecord::new(
            &self.run_id,
            RunErrorScope::TaskExecutionError,
            format!("task '{}': {}", task.name, message),
        );
        self.store.persist_run_error(&error).await?;

        emit(
            self.store.as_ref(),
            &self.run_id,
            event_types::TASK_ERROR,
            Some(self.phase),
            format!("task '{}' errored", task.name),
            Some(serde_json::json!({"task_id": task.task_id, "message": message})),
        )
        .await?;
        Ok(())
    }

    async fn skip_task(&self, task: &Task, reason: StopReason) -> Result<(), PoolError> {
        let execution = TaskExecution::new(&self.run_id, &task.task_id, &self.worker.id, self.phase);
        self.store.create_task_execution(&execution).await?;
        self.store
            .finalize_task_execution(&execution.id, TaskStatus::Skipped, Some(reason))
            .await?;
        self.store
            .update_task_status(&self.run_id, &task.task_id, TaskStatus::Skipped)
            .await?;
        emit(
            self.store.as_ref(),
            &self.run_id,
            event_types::TASK_SKIPPED,
            Some(self.phase),
            format!("task '{}' skipped: {}", task.name, reason),
            None,
        )
        .await?;
        Ok(())
    }
}
