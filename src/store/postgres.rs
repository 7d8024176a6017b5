//! Postgres store backed by sqlx.
//!
//! Nested structures (config, totals, step records, evaluations, agent
//! state) are encoded as JSONB at this boundary; the rest of the system
//! only ever sees the typed forms. Run cost is incremented with a single
//! `UPDATE … SET cost_estimate = cost_estimate + $n` so concurrent
//! writers always observe monotonic totals.
//!
//! Event appends assign `seq = max(seq) + 1` optimistically and retry on
//! the `(run_id, seq)` unique-constraint conflict with small randomized
//! backoff. This tolerates multiple writer processes without a central
//! sequencer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::ingest::{Artifact, ArtifactType};
use crate::types::{
    AgentMemoryState, CallUsage, Citation, DeterministicCheck, EventPayload, PhaseTotals, Run,
    RunEvent, RunErrorRecord, RunPhase, RunStatus, SkillOptimizationSession, StepRecord, StepTrace,
    StopReason, Task, TaskAttempt, TaskEvaluation, TaskExecution, TaskStatus, Worker, WorkerStatus,
};

use super::{schema, Store, StoreError};

/// Maximum attempts for the optimistic event-seq insert.
const EVENT_APPEND_ATTEMPTS: u32 = 24;

/// Postgres implementation of [`Store`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn run_status(&self, run_id: &str) -> Result<RunStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run_id)))?;
        let status: String = row.try_get("status")?;
        decode_slug(&status)
    }

    async fn run_status_for_execution(&self, execution_id: &str) -> Result<(String, RunStatus), StoreError> {
        let row = sqlx::query(
            "SELECT r.id AS run_id, r.status FROM runs r \
             JOIN task_executions e ON e.run_id = r.id WHERE e.id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", execution_id)))?;
        let run_id: String = row.try_get("run_id")?;
        let status: String = row.try_get("status")?;
        Ok((run_id, decode_slug(&status)?))
    }

    /// Rejects execution-scoped writes once the run is finalized.
    async fn guard_execution_write(&self, execution_id: &str) -> Result<(), StoreError> {
        let (run_id, status) = self.run_status_for_execution(execution_id).await?;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed { run_id });
        }
        Ok(())
    }

    fn is_unique_violation(error: &sqlx::Error) -> bool {
        matches!(
            error,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
        )
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

/// Encodes a snake_case enum through its serde string form.
fn encode_slug<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(serde::de::Error::custom(
            format!("expected string slug, got {}", other),
        ))),
    }
}

fn decode_slug<T: serde::de::DeserializeOwned>(slug: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        slug.to_string(),
    ))?)
}

fn decode_run(row: &sqlx::postgres::PgRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    let totals: Option<serde_json::Value> = row.try_get("totals")?;
    Ok(Run {
        id: row.try_get("id")?,
        docs_url: row.try_get("docs_url")?,
        status: decode_slug(&status)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        config: decode(row.try_get("config")?)?,
        totals: totals.map(decode).transpose()?,
        cost_estimate: row.try_get("cost_estimate")?,
    })
}

fn decode_execution(row: &sqlx::postgres::PgRow) -> Result<TaskExecution, StoreError> {
    let status: String = row.try_get("status")?;
    let phase: String = row.try_get("phase")?;
    let stop_reason: Option<String> = row.try_get("stop_reason")?;
    Ok(TaskExecution {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        task_id: row.try_get("task_id")?,
        worker_id: row.try_get("worker_id")?,
        phase: decode_slug(&phase)?,
        status: decode_slug(&status)?,
        step_count: row.try_get::<i64, _>("step_count")? as u32,
        tokens_in: row.try_get::<i64, _>("tokens_in")? as u64,
        tokens_out: row.try_get::<i64, _>("tokens_out")? as u64,
        cost_estimate: row.try_get("cost_estimate")?,
        stop_reason: stop_reason.as_deref().map(decode_slug).transpose()?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO runs (id, docs_url, status, started_at, ended_at, config, totals, cost_estimate) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&run.id)
        .bind(&run.docs_url)
        .bind(encode_slug(&run.status)?)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(encode(&run.config)?)
        .bind(run.totals.as_ref().map(encode).transpose()?)
        .bind(run.cost_estimate)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if Self::is_unique_violation(&e) => {
                Err(StoreError::Conflict(format!("run '{}' exists", run.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run_id)))?;
        decode_run(&row)
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
    ) -> Result<bool, StoreError> {
        let current = self.run_status(run_id).await?;
        if current.is_terminal() || !current.can_transition_to(status) {
            return Ok(false);
        }
        // Compare-and-set against the status we just read; a racing writer
        // makes this a no-op rather than an illegal transition.
        let result = sqlx::query("UPDATE runs SET status = $1 WHERE id = $2 AND status = $3")
            .bind(encode_slug(&status)?)
            .bind(run_id)
            .bind(encode_slug(&current)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        totals: Option<PhaseTotals>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE runs SET status = $1, totals = $2, ended_at = $3 WHERE id = $4",
        )
        .bind(encode_slug(&status)?)
        .bind(totals.as_ref().map(encode).transpose()?)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run '{}'", run_id)));
        }

        sqlx::query(
            "UPDATE workers SET status = 'done' WHERE run_id = $1 AND status NOT IN ('done', 'error')",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn increment_run_cost(&self, run_id: &str, delta: f64) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "UPDATE runs SET cost_estimate = cost_estimate + $1 WHERE id = $2 RETURNING cost_estimate",
        )
        .bind(delta)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run_id)))?;
        Ok(row.try_get("cost_estimate")?)
    }

    async fn is_run_canceled(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.run_status(run_id).await? == RunStatus::Canceled)
    }

    async fn persist_ingestion_artifacts(
        &self,
        run_id: &str,
        artifacts: &[Artifact],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM run_artifacts WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        for artifact in artifacts {
            sqlx::query(
                "INSERT INTO run_artifacts (run_id, artifact_type, source_url, content, content_hash, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(run_id)
            .bind(encode_slug(&artifact.artifact_type)?)
            .bind(&artifact.source_url)
            .bind(&artifact.content)
            .bind(&artifact.content_hash)
            .bind(artifact.metadata.clone())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_run_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query(
            "SELECT artifact_type, source_url, content, content_hash, metadata \
             FROM run_artifacts WHERE run_id = $1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let artifact_type: String = row.try_get("artifact_type")?;
                Ok(Artifact {
                    artifact_type: decode_slug::<ArtifactType>(&artifact_type)?,
                    source_url: row.try_get("source_url")?,
                    content: row.try_get("content")?,
                    content_hash: row.try_get("content_hash")?,
                    metadata: row.try_get("metadata")?,
                })
            })
            .collect()
    }

    async fn persist_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tasks (task_id, run_id, name, description, category, difficulty, expected_signals, status, position) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (task_id) DO UPDATE SET status = EXCLUDED.status",
            )
            .bind(&task.task_id)
            .bind(&task.run_id)
            .bind(&task.name)
            .bind(&task.description)
            .bind(&task.category)
            .bind(&task.difficulty)
            .bind(encode(&task.expected_signals)?)
            .bind(encode_slug(&task.status)?)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE run_id = $1 ORDER BY position")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(Task {
                    task_id: row.try_get("task_id")?,
                    run_id: row.try_get("run_id")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    category: row.try_get("category")?,
                    difficulty: row.try_get("difficulty")?,
                    expected_signals: decode(row.try_get("expected_signals")?)?,
                    status: decode_slug(&status)?,
                })
            })
            .collect()
    }

    async fn update_task_status(
        &self,
        run_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = $1 WHERE run_id = $2 AND task_id = $3")
            .bind(encode_slug(&status)?)
            .bind(run_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task '{}'", task_id)));
        }
        Ok(())
    }

    async fn ensure_run_workers(
        &self,
        run_id: &str,
        workers: &[Worker],
    ) -> Result<Vec<Worker>, StoreError> {
        let existing = self.list_workers(run_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let mut tx = self.pool.begin().await?;
        for worker in workers {
            sqlx::query(
                "INSERT INTO workers (id, run_id, worker_label, model_provider, model_name, model_config, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (run_id, worker_label) DO NOTHING",
            )
            .bind(&worker.id)
            .bind(run_id)
            .bind(&worker.worker_label)
            .bind(&worker.model_provider)
            .bind(&worker.model_name)
            .bind(encode(&worker.model_config)?)
            .bind(encode_slug(&worker.status)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.list_workers(run_id).await
    }

    async fn update_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2")
            .bind(encode_slug(&status)?)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("worker '{}'", worker_id)));
        }
        Ok(())
    }

    async fn list_workers(&self, run_id: &str) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workers WHERE run_id = $1 ORDER BY worker_label")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(Worker {
                    id: row.try_get("id")?,
                    run_id: row.try_get("run_id")?,
                    worker_label: row.try_get("worker_label")?,
                    model_provider: row.try_get("model_provider")?,
                    model_name: row.try_get("model_name")?,
                    model_config: decode(row.try_get("model_config")?)?,
                    status: decode_slug(&status)?,
                })
            })
            .collect()
    }

    async fn create_task_execution(&self, execution: &TaskExecution) -> Result<(), StoreError> {
        let status = self.run_status(&execution.run_id).await?;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed {
                run_id: execution.run_id.clone(),
            });
        }
        sqlx::query(
            "INSERT INTO task_executions \
             (id, run_id, task_id, worker_id, phase, status, step_count, tokens_in, tokens_out, cost_estimate, stop_reason, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&execution.id)
        .bind(&execution.run_id)
        .bind(&execution.task_id)
        .bind(&execution.worker_id)
        .bind(encode_slug(&execution.phase)?)
        .bind(encode_slug(&execution.status)?)
        .bind(execution.step_count as i64)
        .bind(execution.tokens_in as i64)
        .bind(execution.tokens_out as i64)
        .bind(execution.cost_estimate)
        .bind(execution.stop_reason.as_ref().map(encode_slug).transpose()?)
        .bind(execution.started_at)
        .bind(execution.ended_at)
        .execute(&self.pool)
        .await?;
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
        self.guard_execution_write(execution_id).await?;
        sqlx::query(
            "UPDATE task_executions SET step_count = $1, tokens_in = $2, tokens_out = $3, cost_estimate = $4 \
             WHERE id = $5",
        )
        .bind(step_count as i64)
        .bind(tokens_in as i64)
        .bind(tokens_out as i64)
        .bind(cost_estimate)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_task_execution(
        &self,
        execution_id: &str,
        status: TaskStatus,
        stop_reason: Option<StopReason>,
    ) -> Result<(), StoreError> {
        self.guard_execution_write(execution_id).await?;
        sqlx::query(
            "UPDATE task_executions SET status = $1, stop_reason = $2, ended_at = $3 WHERE id = $4",
        )
        .bind(encode_slug(&status)?)
        .bind(stop_reason.as_ref().map(encode_slug).transpose()?)
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_task_executions(&self, run_id: &str) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task_executions WHERE run_id = $1 ORDER BY started_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_execution).collect()
    }

    async fn upsert_task_agent_state(&self, state: &AgentMemoryState) -> Result<(), StoreError> {
        self.guard_execution_write(&state.task_execution_id).await?;
        sqlx::query(
            "INSERT INTO task_agent_state (task_execution_id, state) VALUES ($1, $2) \
             ON CONFLICT (task_execution_id) DO UPDATE SET state = EXCLUDED.state",
        )
        .bind(&state.task_execution_id)
        .bind(encode(state)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_agent_state(
        &self,
        execution_id: &str,
    ) -> Result<Option<AgentMemoryState>, StoreError> {
        let row = sqlx::query("SELECT state FROM task_agent_state WHERE task_execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.try_get("state")?)).transpose()
    }

    async fn persist_task_step(
        &self,
        execution_id: &str,
        step_index: u32,
        record: &StepRecord,
        usage: Option<CallUsage>,
    ) -> Result<i64, StoreError> {
        let (run_id, status) = self.run_status_for_execution(execution_id).await?;
        if status.is_terminal() {
            return Err(StoreError::RunClosed { run_id });
        }
        let row = sqlx::query(
            "INSERT INTO task_steps (task_execution_id, step_index, phase, record, usage, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(execution_id)
        .bind(step_index as i64)
        .bind(record.phase().to_string())
        .bind(encode(record)?)
        .bind(usage.as_ref().map(encode).transpose()?)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn persist_task_step_citations(
        &self,
        step_id: i64,
        citations: &[Citation],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for citation in citations {
            sqlx::query(
                "INSERT INTO step_citations (step_id, source, snippet_hash, excerpt, start_offset, end_offset) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(step_id)
            .bind(&citation.source)
            .bind(&citation.snippet_hash)
            .bind(&citation.excerpt)
            .bind(citation.start_offset.map(|v| v as i64))
            .bind(citation.end_offset.map(|v| v as i64))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_task_steps(&self, execution_id: &str) -> Result<Vec<StepTrace>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_execution_id, step_index, record, usage, created_at \
             FROM task_steps WHERE task_execution_id = $1 ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let usage: Option<serde_json::Value> = row.try_get("usage")?;
                Ok(StepTrace {
                    id: row.try_get("id")?,
                    task_execution_id: row.try_get("task_execution_id")?,
                    step_index: row.try_get::<i64, _>("step_index")? as u32,
                    record: decode(row.try_get("record")?)?,
                    usage: usage.map(decode).transpose()?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn persist_deterministic_checks(
        &self,
        execution_id: &str,
        checks: &[DeterministicCheck],
    ) -> Result<(), StoreError> {
        self.guard_execution_write(execution_id).await?;
        let mut tx = self.pool.begin().await?;
        for check in checks {
            sqlx::query(
                "INSERT INTO deterministic_checks (task_execution_id, name, passed, score_delta, details) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(execution_id)
            .bind(&check.name)
            .bind(check.passed)
            .bind(check.score_delta)
            .bind(&check.details)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_deterministic_checks(
        &self,
        execution_id: &str,
    ) -> Result<Vec<DeterministicCheck>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, passed, score_delta, details FROM deterministic_checks \
             WHERE task_execution_id = $1 ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DeterministicCheck {
                    name: row.try_get("name")?,
                    passed: row.try_get("passed")?,
                    score_delta: row.try_get("score_delta")?,
                    details: row.try_get("details")?,
                })
            })
            .collect()
    }

    async fn persist_task_attempt(
        &self,
        execution_id: &str,
        attempt: &TaskAttempt,
    ) -> Result<(), StoreError> {
        self.guard_execution_write(execution_id).await?;
        sqlx::query(
            "INSERT INTO task_attempts (task_execution_id, attempt) VALUES ($1, $2) \
             ON CONFLICT (task_execution_id) DO UPDATE SET attempt = EXCLUDED.attempt",
        )
        .bind(execution_id)
        .bind(encode(attempt)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_task_evaluation(
        &self,
        evaluation: &TaskEvaluation,
    ) -> Result<(), StoreError> {
        let status = self.run_status(&evaluation.run_id).await?;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(StoreError::RunClosed {
                run_id: evaluation.run_id.clone(),
            });
        }
        sqlx::query(
            "INSERT INTO task_evaluations (run_id, task_id, phase, evaluation) VALUES ($1, $2, $3, $4)",
        )
        .bind(&evaluation.run_id)
        .bind(&evaluation.task_id)
        .bind(encode_slug(&evaluation.phase)?)
        .bind(encode(evaluation)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_task_evaluations(
        &self,
        run_id: &str,
        phase: RunPhase,
    ) -> Result<Vec<TaskEvaluation>, StoreError> {
        let rows = sqlx::query(
            "SELECT evaluation FROM task_evaluations WHERE run_id = $1 AND phase = $2 ORDER BY id",
        )
        .bind(run_id)
        .bind(encode_slug(&phase)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| decode(row.try_get("evaluation")?))
            .collect()
    }

    async fn append_run_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &EventPayload,
    ) -> Result<RunEvent, StoreError> {
        let payload_json = encode(payload)?;

        for attempt in 0..EVENT_APPEND_ATTEMPTS {
            let created_at = Utc::now();
            let result = sqlx::query(
                "INSERT INTO run_events (run_id, seq, event_type, payload, created_at) \
                 VALUES ($1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = $1), $2, $3, $4) \
                 RETURNING id, seq",
            )
            .bind(run_id)
            .bind(event_type)
            .bind(&payload_json)
            .bind(created_at)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    return Ok(RunEvent {
                        id: row.try_get("id")?,
                        run_id: run_id.to_string(),
                        seq: row.try_get("seq")?,
                        event_type: event_type.to_string(),
                        payload: payload.clone(),
                        created_at,
                    });
                }
                Err(e) if Self::is_unique_violation(&e) => {
                    debug!(
                        run_id = %run_id,
                        attempt = attempt + 1,
                        "Event seq conflict, retrying append"
                    );
                    let jitter_ms = rand::thread_rng().gen_range(2..20);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Conflict(format!(
            "event append for run '{}' exhausted {} attempts",
            run_id, EVENT_APPEND_ATTEMPTS
        )))
    }

    async fn get_run_events_after(
        &self,
        run_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RunEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, run_id, seq, event_type, payload, created_at \
             FROM run_events WHERE run_id = $1 AND id > $2 ORDER BY id LIMIT $3",
        )
        .bind(run_id)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RunEvent {
                    id: row.try_get("id")?,
                    run_id: row.try_get("run_id")?,
                    seq: row.try_get("seq")?,
                    event_type: row.try_get("event_type")?,
                    payload: decode(row.try_get("payload")?)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn persist_run_error(&self, error: &RunErrorRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run_errors (run_id, scope, message, data, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&error.run_id)
        .bind(error.scope.to_string())
        .bind(&error.message)
        .bind(error.data.clone())
        .bind(error.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_run_errors(&self, run_id: &str) -> Result<Vec<RunErrorRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT scope, message, data, created_at FROM run_errors WHERE run_id = $1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let scope: String = row.try_get("scope")?;
                Ok(RunErrorRecord {
                    run_id: run_id.to_string(),
                    scope: decode(serde_json::Value::String(scope))?,
                    message: row.try_get("message")?,
                    data: row.try_get("data")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn upsert_skill_session(
        &self,
        session: &SkillOptimizationSession,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO skill_optimization_sessions (run_id, session) VALUES ($1, $2) \
             ON CONFLICT (run_id) DO UPDATE SET session = EXCLUDED.session",
        )
        .bind(&session.run_id)
        .bind(encode(session)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_skill_session(
        &self,
        run_id: &str,
    ) -> Result<Option<SkillOptimizationSession>, StoreError> {
        let row = sqlx::query("SELECT session FROM skill_optimization_sessions WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.try_get("session")?)).transpose()
    }

    async fn save_skill_artifact(
        &self,
        run_id: &str,
        content_hash: &str,
        markdown: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO skill_artifacts (run_id, content_hash, markdown, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (run_id, content_hash) DO NOTHING",
        )
        .bind(run_id)
        .bind(content_hash)
        .bind(markdown)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
