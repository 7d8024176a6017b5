//! Run orchestration: the single-run driver, background launch, error
//! sink, and the public API surface callers embed.
//!
//! A run advances `queued → ingesting → generating_tasks → running →
//! evaluating → terminal`, with every boundary emitting an event. The
//! outer driver is the error sink: fatal errors persist a `RUN_FATAL`
//! record and finalize the run as failed; per-task errors never reach
//! here (the pool converts them to fallback evaluations).

pub mod phase;
pub mod pool;
pub mod tasks;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::agent::AgentLoop;
use crate::config::{ConfigError, RunConfig, RunRequest};
use crate::error::IngestError;
use crate::eval::judge::RubricJudge;
use crate::events::{self, emit, event_types};
use crate::ingest::{IngestOptions, Ingestor};
use crate::llm::{CostModel, ModelClient, ModelConfig};
use crate::store::{Store, StoreError};
use crate::types::{
    PhaseTotals, Run, RunErrorRecord, RunErrorScope, RunEvent, RunPhase, RunStatus,
    SkillOptimizationSession, Task, TaskEvaluation, TaskExecution, Worker,
};

use phase::{build_workers, PhaseError, PhaseExecutor};
use pool::WorkerPool;

/// Errors surfaced by orchestration entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid run request: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("Phase execution failed: {0}")]
    Phase(#[from] PhaseError),
}

/// Snapshot of a run for observers.
#[derive(Debug, Clone)]
pub struct RunDetail {
    pub run: Run,
    pub tasks: Vec<Task>,
    pub workers: Vec<Worker>,
    pub executions: Vec<TaskExecution>,
    pub baseline_evaluations: Vec<TaskEvaluation>,
    pub optimized_evaluations: Vec<TaskEvaluation>,
    pub errors: Vec<RunErrorRecord>,
    pub session: Option<SkillOptimizationSession>,
}

/// Single-process run orchestrator.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    ingestor: Arc<dyn Ingestor>,
    client: Arc<dyn ModelClient>,
    pricing: Arc<dyn CostModel>,
    ingest_options: IngestOptions,
    in_flight: Mutex<HashSet<String>>,
}

impl Orchestrator {
    /// Creates an orchestrator over the external collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        ingestor: Arc<dyn Ingestor>,
        client: Arc<dyn ModelClient>,
        pricing: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            store,
            ingestor,
            client,
            pricing,
            ingest_options: IngestOptions::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Overrides the ingestion options.
    pub fn with_ingest_options(mut self, options: IngestOptions) -> Self {
        self.ingest_options = options;
        self
    }

    /// Validates a request and creates a queued run.
    pub async fn create_run(&self, request: &RunRequest) -> Result<String, OrchestratorError> {
        let config = RunConfig::from_request(request)?;
        let run = Run::new(request.docs_url.trim(), config);
        self.store.create_run(&run).await?;
        emit(
            self.store.as_ref(),
            &run.id,
            event_types::RUN_CREATED,
            None,
            format!("run created for {}", run.docs_url),
            None,
        )
        .await?;
        info!(run_id = %run.id, docs_url = %run.docs_url, "Run created");
        Ok(run.id)
    }

    /// Launches the run driver in the background. Idempotent per process:
    /// a duplicate start while the run is in flight returns false.
    pub fn start_run_in_background(self: Arc<Self>, run_id: &str) -> bool {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(run_id.to_string()) {
                return false;
            }
        }

        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = self.drive_run(&run_id).await {
                self.sink_fatal(&run_id, e).await;
            }
            self.in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&run_id);
        });
        true
    }

    /// Cancels a non-terminal run. Fire-and-forget: in-flight model calls
    /// are not interrupted, but no further iteration, phase, or task
    /// starts after the flag is observed.
    pub async fn cancel_run(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        let applied = self
            .store
            .update_run_status(run_id, RunStatus::Canceled)
            .await?;
        if applied {
            emit(
                self.store.as_ref(),
                run_id,
                event_types::RUN_CANCELED,
                None,
                "run canceled",
                None,
            )
            .await?;
            info!(run_id = %run_id, "Run canceled");
        }
        Ok(applied)
    }

    /// Snapshot of everything observers need about one run.
    pub async fn get_run_detail(&self, run_id: &str) -> Result<RunDetail, OrchestratorError> {
        Ok(RunDetail {
            run: self.store.get_run(run_id).await?,
            tasks: self.store.list_tasks(run_id).await?,
            workers: self.store.list_workers(run_id).await?,
            executions: self.store.list_task_executions(run_id).await?,
            baseline_evaluations: self
                .store
                .list_task_evaluations(run_id, RunPhase::Baseline)
                .await?,
            optimized_evaluations: self
                .store
                .list_task_evaluations(run_id, RunPhase::Optimized)
                .await?,
            errors: self.store.list_run_errors(run_id).await?,
            session: self.store.get_skill_session(run_id).await?,
        })
    }

    /// Streams events after `after_id`; the channel closes after a
    /// terminal `run.{completed|failed|canceled}` event is delivered.
    pub fn stream_events(&self, run_id: &str, after_id: i64) -> mpsc::Receiver<RunEvent> {
        events::stream_events(Arc::clone(&self.store), run_id.to_string(), after_id)
    }

    /// The single-run driver.
    async fn drive_run(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let config = run.config.clone();

        emit(
            self.store.as_ref(),
            run_id,
            event_types::RUN_STARTED,
            None,
            "run started",
            None,
        )
        .await?;

        // Ingest
        if !self
            .advance(run_id, RunStatus::Ingesting, event_types::RUN_INGESTING)
            .await?
        {
            return self.finalize_canceled(run_id).await;
        }
        let ingestion = self
            .ingestor
            .ingest(&run.docs_url, &self.ingest_options)
            .await?;
        self.store
            .persist_ingestion_artifacts(run_id, &ingestion.artifacts)
            .await?;
        info!(
            run_id = %run_id,
            artifacts = ingestion.artifacts.len(),
            "Ingestion complete"
        );

        // Synthesize tasks
        if !self
            .advance(
                run_id,
                RunStatus::GeneratingTasks,
                event_types::RUN_GENERATING_TASKS,
            )
            .await?
        {
            return self.finalize_canceled(run_id).await;
        }
        let task_list = tasks::synthesize_tasks(run_id, &config, &ingestion.artifacts);
        self.store.persist_tasks(&task_list).await?;
        info!(run_id = %run_id, tasks = task_list.len(), "Task list synthesized");

        // Provision workers (idempotent)
        let workers = build_workers(run_id, &config);
        self.store.ensure_run_workers(run_id, &workers).await?;

        // Execute phases
        if !self
            .advance(run_id, RunStatus::Running, event_types::RUN_RUNNING)
            .await?
        {
            return self.finalize_canceled(run_id).await;
        }
        let executor = PhaseExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.build_pool(&config),
        );
        let outcome = executor.execute(run_id, &config, &run.docs_url).await?;

        if self.store.is_run_canceled(run_id).await? {
            return self.finalize_canceled(run_id).await;
        }

        // Finalize
        if !self
            .advance(run_id, RunStatus::Evaluating, event_types::RUN_EVALUATING)
            .await?
        {
            return self.finalize_canceled(run_id).await;
        }
        self.store
            .finalize_run(run_id, RunStatus::Completed, outcome.totals.clone())
            .await?;
        emit(
            self.store.as_ref(),
            run_id,
            event_types::RUN_COMPLETED,
            None,
            "run completed",
            outcome
                .totals
                .as_ref()
                .map(|t| serde_json::to_value(t).unwrap_or_default()),
        )
        .await?;
        info!(run_id = %run_id, "Run completed");
        Ok(())
    }

    fn build_pool(&self, config: &RunConfig) -> WorkerPool {
        let agent = Arc::new(AgentLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            Arc::clone(&self.pricing),
        ));
        let judge_config = ModelConfig::new("openrouter", &config.judge_model)
            .with_timeout_ms(config.timeout_ms)
            .with_retries(config.model_retries);
        let judge = Arc::new(RubricJudge::new(
            Arc::clone(&self.client),
            judge_config,
            config.tie_break_enabled,
        ));
        WorkerPool::new(
            Arc::clone(&self.store),
            agent,
            judge,
            Arc::clone(&self.pricing),
        )
    }

    /// Applies a status transition and emits its event. Returns false
    /// when the transition did not apply (the run went terminal
    /// underneath us, e.g. a concurrent cancel).
    async fn advance(
        &self,
        run_id: &str,
        status: RunStatus,
        event_type: &str,
    ) -> Result<bool, OrchestratorError> {
        let applied = self.store.update_run_status(run_id, status).await?;
        if applied {
            emit(
                self.store.as_ref(),
                run_id,
                event_type,
                None,
                format!("run is {}", status),
                None,
            )
            .await?;
        }
        Ok(applied)
    }

    /// Finalizes a canceled run with whatever partial totals exist.
    async fn finalize_canceled(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let totals = self.partial_totals(run_id).await?;
        self.store
            .finalize_run(run_id, RunStatus::Canceled, totals)
            .await?;
        info!(run_id = %run_id, "Run finalized after cancellation");
        Ok(())
    }

    /// Aggregates whatever evaluations exist, preferring the optimized
    /// phase. Returns `None` when no evaluation was ever produced.
    async fn partial_totals(&self, run_id: &str) -> Result<Option<PhaseTotals>, OrchestratorError> {
        let optimized = self
            .store
            .list_task_evaluations(run_id, RunPhase::Optimized)
            .await?;
        if !optimized.is_empty() {
            return Ok(Some(crate::eval::aggregate(&optimized)));
        }
        let baseline = self
            .store
            .list_task_evaluations(run_id, RunPhase::Baseline)
            .await?;
        if !baseline.is_empty() {
            return Ok(Some(crate::eval::aggregate(&baseline)));
        }
        Ok(None)
    }

    /// Outer error sink: persists `RUN_FATAL` and finalizes the run as
    /// failed. Failures inside the sink itself are logged and dropped.
    async fn sink_fatal(&self, run_id: &str, error: OrchestratorError) {
        error!(run_id = %run_id, error = %error, "Run failed");

        let record = RunErrorRecord::new(run_id, RunErrorScope::RunFatal, error.to_string());
        if let Err(e) = self.store.persist_run_error(&record).await {
            error!(run_id = %run_id, error = %e, "Failed to persist RUN_FATAL");
        }
        if let Err(e) = self
            .store
            .finalize_run(run_id, RunStatus::Failed, None)
            .await
        {
            error!(run_id = %run_id, error = %e, "Failed to finalize failed run");
        }
        if let Err(e) = emit(
            self.store.as_ref(),
            run_id,
            event_types::RUN_FAILED,
            None,
            format!("run failed: {}", record.message),
            None,
        )
        .await
        {
            error!(run_id = %run_id, error = %e, "Failed to emit run.failed");
        }
    }
}
