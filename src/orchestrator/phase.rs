//! Phase executor: baseline run, optional skill optimization, optimized
//! re-run, and delta computation.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::LlmError;
use crate::eval::{aggregate, compute_delta};
use crate::events::{emit, event_types};
use crate::ingest::{Artifact, ArtifactType};
use crate::llm::{ModelClient, ModelConfig};
use crate::prompts;
use crate::retrieval::RetrievalIndex;
use crate::store::{Store, StoreError};
use crate::types::{
    PhaseTotals, RunErrorRecord, RunErrorScope, RunPhase, SessionStatus, SkillOptimizationSession,
    SkillOrigin, TaskEvaluation, TaskStatus, Worker,
};

use super::pool::{PoolError, WorkerPool};

/// Source URL assigned to the generated skill artifact.
pub const OPTIMIZED_SKILL_URL: &str = "docforge://optimized-skill";

/// Errors that abort phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Outcome of the full phase sequence.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    /// The totals the run finalizes with (optimized when that phase ran,
    /// baseline otherwise, `None` when no evaluation exists).
    pub totals: Option<PhaseTotals>,
}

/// Runs the baseline and (optionally) optimized phases of one run.
pub struct PhaseExecutor {
    store: Arc<dyn Store>,
    client: Arc<dyn ModelClient>,
    pool: WorkerPool,
}

impl PhaseExecutor {
    /// Creates an executor over the shared collaborators.
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn ModelClient>, pool: WorkerPool) -> Self {
        Self {
            store,
            client,
            pool,
        }
    }

    /// Executes the baseline phase and, when enabled and useful, the
    /// skill-optimization branch.
    pub async fn execute(
        &self,
        run_id: &str,
        config: &RunConfig,
        docs_url: &str,
    ) -> Result<PhaseOutcome, PhaseError> {
        let artifacts = self.store.get_run_artifacts(run_id).await?;
        let tasks = self.store.list_tasks(run_id).await?;
        let workers = self.store.list_workers(run_id).await?;

        // Baseline phase
        let index = Arc::new(RetrievalIndex::build(&artifacts));
        emit(
            self.store.as_ref(),
            run_id,
            event_types::PHASE_STARTED,
            Some(RunPhase::Baseline),
            "baseline phase started",
            None,
        )
        .await?;
        self.pool
            .run_phase(
                run_id,
                RunPhase::Baseline,
                config,
                index,
                tasks.clone(),
                workers.clone(),
            )
            .await?;

        let baseline_evaluations = self
            .store
            .list_task_evaluations(run_id, RunPhase::Baseline)
            .await?;
        let baseline = aggregate(&baseline_evaluations);
        emit(
            self.store.as_ref(),
            run_id,
            event_types::PHASE_COMPLETED,
            Some(RunPhase::Baseline),
            format!(
                "baseline phase completed: {}/{} passed",
                baseline.passed_tasks, baseline.total_tasks
            ),
            Some(serde_json::to_value(&baseline).unwrap_or_default()),
        )
        .await?;

        let baseline_totals = if baseline_evaluations.is_empty() {
            None
        } else {
            Some(baseline.clone())
        };

        if self.store.is_run_canceled(run_id).await? {
            return Ok(PhaseOutcome {
                totals: baseline_totals,
            });
        }

        // Optimization branch
        let failures: Vec<TaskEvaluation> = baseline_evaluations
            .iter()
            .filter(|e| !e.pass)
            .cloned()
            .collect();
        let site_skill = artifacts
            .iter()
            .find(|a| a.artifact_type == ArtifactType::Skill)
            .map(|a| a.content.clone());
        let origin = if site_skill.is_some() {
            SkillOrigin::SiteSkill
        } else {
            SkillOrigin::None
        };

        if !config.enable_skill_optimization || failures.is_empty() {
            let mut session = SkillOptimizationSession::new(run_id, origin);
            session.status = SessionStatus::Skipped;
            session.baseline_totals = baseline_totals.clone();
            self.store.upsert_skill_session(&session).await?;
            return Ok(PhaseOutcome {
                totals: baseline_totals,
            });
        }

        let mut session = SkillOptimizationSession::new(run_id, origin);
        session.status = SessionStatus::Running;
        session.baseline_totals = Some(baseline.clone());
        self.store.upsert_skill_session(&session).await?;

        emit(
            self.store.as_ref(),
            run_id,
            event_types::SKILL_GENERATION_STARTED,
            Some(RunPhase::Baseline),
            format!("generating skill from {} failures", failures.len()),
            None,
        )
        .await?;

        let skill_markdown = match self
            .generate_skill(config, docs_url, site_skill.as_deref(), &failures)
            .await
        {
            Ok(markdown) => markdown,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Skill generation failed");
                session.status = SessionStatus::Error;
                session.error_message = Some(e.to_string());
                self.store.upsert_skill_session(&session).await?;
                self.store
                    .persist_run_error(&RunErrorRecord::new(
                        run_id,
                        RunErrorScope::SkillOptimizationError,
                        e.to_string(),
                    ))
                    .await?;
                emit(
                    self.store.as_ref(),
                    run_id,
                    event_types::SKILL_GENERATION_FAILED,
                    Some(RunPhase::Baseline),
                    format!("skill generation failed: {}", e),
                    None,
                )
                .await?;
                // Baseline totals are authoritative when optimization fails.
                return Ok(PhaseOutcome {
                    totals: baseline_totals,
                });
            }
        };

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(skill_markdown.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        self.store
            .save_skill_artifact(run_id, &content_hash, &skill_markdown)
            .await?;
        emit(
            self.store.as_ref(),
            run_id,
            event_types::SKILL_GENERATION_COMPLETED,
            Some(RunPhase::Baseline),
            "optimized skill generated",
            Some(serde_json::json!({"content_hash": content_hash})),
        )
        .await?;

        // Re-derive the artifact set with the optimized skill substituted
        // for any site skill, and rebuild the index.
        let mut optimized_artifacts: Vec<Artifact> = artifacts
            .iter()
            .filter(|a| a.artifact_type != ArtifactType::Skill)
            .cloned()
            .collect();
        optimized_artifacts.push(Artifact::new(
            ArtifactType::Skill,
            OPTIMIZED_SKILL_URL,
            skill_markdown,
        ));
        let optimized_index = Arc::new(RetrievalIndex::build(&optimized_artifacts));

        // All tasks run again under the optimized phase.
        let mut optimized_tasks = tasks;
        for task in optimized_tasks.iter_mut() {
            task.status = TaskStatus::Pending;
            self.store
                .update_task_status(run_id, &task.task_id, TaskStatus::Pending)
                .await?;
        }

        emit(
            self.store.as_ref(),
            run_id,
            event_types::PHASE_STARTED,
            Some(RunPhase::Optimized),
            "optimized phase started",
            None,
        )
        .await?;
        self.pool
            .run_phase(
                run_id,
                RunPhase::Optimized,
                config,
                optimized_index,
                optimized_tasks,
                workers,
            )
            .await?;

        let optimized_evaluations = self
            .store
            .list_task_evaluations(run_id, RunPhase::Optimized)
            .await?;
        let optimized = aggregate(&optimized_evaluations);
        emit(
            self.store.as_ref(),
            run_id,
            event_types::PHASE_COMPLETED,
            Some(RunPhase::Optimized),
            format!(
                "optimized phase completed: {}/{} passed",
                optimized.passed_tasks, optimized.total_tasks
            ),
            Some(serde_json::to_value(&optimized).unwrap_or_default()),
        )
        .await?;

        if self.store.is_run_canceled(run_id).await? {
            let totals = if optimized_evaluations.is_empty() {
                baseline_totals
            } else {
                Some(optimized.clone())
            };
            return Ok(PhaseOutcome { totals });
        }

        let delta = compute_delta(&baseline, &optimized);
        info!(
            run_id = %run_id,
            pass_rate_delta = delta.pass_rate_delta,
            passed_tasks_delta = delta.passed_tasks_delta,
            "Skill optimization measured"
        );

        session.status = SessionStatus::Completed;
        session.optimized_totals = Some(optimized.clone());
        session.delta = Some(delta);
        self.store.upsert_skill_session(&session).await?;

        Ok(PhaseOutcome {
            totals: Some(optimized),
        })
    }

    /// Generates the optimized skill document with a schema-constrained
    /// model call and validates its required sections.
    async fn generate_skill(
        &self,
        config: &RunConfig,
        docs_url: &str,
        site_skill: Option<&str>,
        failures: &[TaskEvaluation],
    ) -> Result<String, LlmError> {
        let model_config = ModelConfig::new("openrouter", &config.run_model)
            .with_timeout_ms(config.timeout_ms)
            .with_retries(config.model_retries);
        let messages = prompts::build_skill_messages(docs_url, site_skill, failures);
        let completion = self
            .client
            .complete_json(&model_config, &messages, &prompts::skill_schema())
            .await?;

        let markdown = completion
            .parsed
            .get("optimized_skill_markdown")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                LlmError::ParseError("missing optimized_skill_markdown".to_string())
            })?
            .to_string();

        let missing: Vec<&str> = prompts::SKILL_SECTIONS
            .iter()
            .filter(|section| !markdown.contains(**section))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(LlmError::ParseError(format!(
                "skill document missing sections: {}",
                missing.join(", ")
            )));
        }

        Ok(markdown)
    }
}

/// Builds the worker set from the run's assignment table. Labels are
/// unique within the run.
pub fn build_workers(run_id: &str, config: &RunConfig) -> Vec<Worker> {
    let mut workers = Vec::new();
    for assignment in &config.assignments {
        for _ in 0..assignment.quantity {
            let position = workers.len();
            workers.push(Worker {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run_id.to_string(),
                worker_label: format!("{}-{}", short_model_name(&assignment.model), position),
                model_provider: assignment.provider.clone(),
                model_name: assignment.model.clone(),
                model_config: assignment.overrides.clone(),
                status: crate::types::WorkerStatus::Idle,
            });
        }
    }
    workers
}

fn short_model_name(model: &str) -> String {
    model
        .rsplit('/')
        .next()
        .unwrap_or(model)
        .to_string()
}
