//! Bounded agent loop: retrieve, plan, act, reflect.
//!
//! One loop instance drives one `(task, worker)` pair through at most
//! `max_steps_per_task` iterations. Every model call's usage is applied
//! through the budget accountant before the next phase runs, each phase
//! persists a step trace (and an event), and the agent's memory row is
//! upserted as state changes. Cancellation is observed between phases;
//! in-flight model calls are never interrupted.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::budget::{BudgetAccountant, TaskBudget};
use crate::config::RunConfig;
use crate::error::LlmError;
use crate::eval::expected_signal_coverage;
use crate::events::{emit, event_types};
use crate::llm::{CostModel, ModelClient, ModelConfig, Usage};
use crate::prompts;
use crate::retrieval::{RetrievalIndex, ScoredChunk};
use crate::store::{Store, StoreError};
use crate::types::{
    AgentMemoryState, CallUsage, ChunkRef, Citation, PlanItem, StepRecord, StopReason, Task,
    TaskAttempt, TaskExecution, Worker,
};

/// Chunks retrieved per iteration.
pub const RETRIEVE_TOP_K: usize = 8;

/// Expected-signal coverage below which reflect may not stop early.
const REFLECT_COVERAGE_FLOOR: f64 = 0.75;

/// Facts retained in agent memory.
const MEMORY_FACTS_KEEP: usize = 20;

/// Step summaries retained in agent memory.
const MEMORY_SUMMARIES_KEEP: usize = 12;

/// Errors that can occur while driving the agent loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to parse {phase} response: {message}")]
    Parse { phase: &'static str, message: String },
}

/// What one loop run produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub attempt: TaskAttempt,
    pub stop_reason: StopReason,
    pub step_count: u32,
    /// Chunks retrieved across all iterations, for judge evidence.
    pub evidence: Vec<ScoredChunk>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    plan_items: Vec<String>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct ActCitation {
    source: String,
    snippet_hash: String,
    excerpt: String,
}

#[derive(Debug, Deserialize)]
struct ActResponse {
    answer: String,
    step_output: String,
    citations: Vec<ActCitation>,
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    discovered_facts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReflectResponse {
    should_continue: bool,
    summary: String,
    #[serde(default)]
    plan_updates: Vec<String>,
    confidence: f64,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Drives the retrieve/plan/act/reflect loop for task executions.
pub struct AgentLoop {
    store: Arc<dyn Store>,
    client: Arc<dyn ModelClient>,
    pricing: Arc<dyn CostModel>,
    giving_up: Regex,
}

impl AgentLoop {
    /// Creates a loop driver over the shared collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn ModelClient>,
        pricing: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            store,
            client,
            pricing,
            giving_up: Regex::new(
                r"(?i)\bno\b[^.\n]*\b(found|available|documented)\b|\bunable to (find|locate|access|determine)\b",
            )
            .expect("giving-up pattern is valid"),
        }
    }

    /// Runs the bounded loop for one execution.
    ///
    /// Returns the final attempt and stop reason. The execution's progress
    /// counters are updated after every model call; callers finalize the
    /// execution and decide whether to evaluate.
    pub async fn run(
        &self,
        config: &RunConfig,
        index: &RetrievalIndex,
        task: &Task,
        worker: &Worker,
        execution: &TaskExecution,
    ) -> Result<AgentOutcome, AgentError> {
        let run_id = &execution.run_id;
        let model_config = ModelConfig::new(&worker.model_provider, &worker.model_name)
            .with_timeout_ms(config.timeout_ms)
            .with_retries(config.model_retries)
            .with_overrides(&worker.model_config);

        let mut accountant = BudgetAccountant::new(TaskBudget {
            max_steps: config.max_steps_per_task,
            max_tokens: config.max_tokens_per_task,
            hard_cost_cap_usd: config.hard_cost_cap_usd,
        });
        let mut tokens_in: u64 = 0;
        let mut tokens_out: u64 = 0;

        let mut memory = AgentMemoryState::new(&execution.id, &task.name);
        memory.remaining_budget = accountant.remaining();
        self.store.upsert_task_agent_state(&memory).await?;

        let mut attempt = TaskAttempt::default();
        let mut evidence: Vec<ScoredChunk> = Vec::new();
        let mut stop_reason: Option<StopReason> = None;

        for step_index in 0..config.max_steps_per_task {
            if let Some(reason) = accountant.check_iteration_start() {
                stop_reason = Some(reason);
                break;
            }
            if self.store.is_run_canceled(run_id).await? {
                stop_reason = Some(StopReason::Cancelled);
                break;
            }

            memory.current_step = step_index;

            // -- retrieve ---------------------------------------------------
            let query = build_query(task, &memory);
            let chunks = index.retrieve(&query, RETRIEVE_TOP_K);
            let chunk_refs: Vec<ChunkRef> = chunks
                .iter()
                .map(|c| ChunkRef {
                    source_url: c.source_url.clone(),
                    snippet_hash: c.snippet_hash.clone(),
                    score: c.score,
                })
                .collect();
            for chunk in &chunks {
                if !evidence
                    .iter()
                    .any(|e| e.source_url == chunk.source_url && e.snippet_hash == chunk.snippet_hash)
                {
                    evidence.push(chunk.clone());
                }
            }
            let retrieve_record = StepRecord::Retrieve {
                query: query.clone(),
                chunks: chunk_refs.clone(),
            };
            if self
                .persist_step(execution, step_index, &retrieve_record, None)
                .await?
                .is_none()
            {
                stop_reason = Some(StopReason::Cancelled);
                break;
            }

            // -- plan -------------------------------------------------------
            let plan_messages = prompts::build_plan_messages(task, &memory, &chunks);
            let completion = self
                .client
                .complete_json(&model_config, &plan_messages, &prompts::plan_schema())
                .await?;
            let plan: PlanResponse =
                serde_json::from_value(completion.parsed).map_err(|e| AgentError::Parse {
                    phase: "plan",
                    message: e.to_string(),
                })?;
            let plan_usage = self
                .apply_usage(
                    execution,
                    &mut accountant,
                    &mut memory,
                    &mut tokens_in,
                    &mut tokens_out,
                    completion.usage,
                )
                .await?;
            let plan_record = StepRecord::Plan {
                plan_items: plan.plan_items.clone(),
                rationale: plan.rationale.clone(),
            };
            if self
                .persist_step(execution, step_index, &plan_record, Some(plan_usage.0))
                .await?
                .is_none()
            {
                stop_reason = Some(StopReason::Cancelled);
                break;
            }
            if let Some(reason) = plan_usage.1 {
                stop_reason = Some(reason);
                break;
            }

            // -- act --------------------------------------------------------
            let act_messages =
                prompts::build_act_messages(task, &memory, &chunks, &plan.plan_items);
            let completion = self
                .client
                .complete_json(&model_config, &act_messages, &prompts::act_schema())
                .await?;
            let act: ActResponse =
                serde_json::from_value(completion.parsed).map_err(|e| AgentError::Parse {
                    phase: "act",
                    message: e.to_string(),
                })?;
            let act_usage = self
                .apply_usage(
                    execution,
                    &mut accountant,
                    &mut memory,
                    &mut tokens_in,
                    &mut tokens_out,
                    completion.usage,
                )
                .await?;

            let citations: Vec<Citation> = act
                .citations
                .iter()
                .map(|c| Citation {
                    source: c.source.clone(),
                    snippet_hash: Some(c.snippet_hash.clone()),
                    excerpt: c.excerpt.clone(),
                    start_offset: None,
                    end_offset: None,
                })
                .collect();

            attempt.answer = act.answer.clone();
            if !act.step_output.trim().is_empty() {
                attempt.steps.push(act.step_output.clone());
            }
            for citation in &citations {
                if !attempt.citations.iter().any(|existing| {
                    existing.source == citation.source
                        && existing.snippet_hash == citation.snippet_hash
                }) {
                    attempt.citations.push(citation.clone());
                }
            }

            let act_record = StepRecord::Act {
                answer: act.answer.clone(),
                step_output: act.step_output.clone(),
                citations: citations.clone(),
                chunks_used: chunk_refs,
                done: act.done,
                done_reason: act.done_reason.clone(),
                discovered_facts: act.discovered_facts.clone(),
            };
            match self
                .persist_step(execution, step_index, &act_record, Some(act_usage.0))
                .await?
            {
                Some(step_id) => {
                    self.store
                        .persist_task_step_citations(step_id, &citations)
                        .await?;
                }
                None => {
                    stop_reason = Some(StopReason::Cancelled);
                    break;
                }
            }
            if let Some(reason) = act_usage.1 {
                stop_reason = Some(reason);
                break;
            }

            // -- reflect ----------------------------------------------------
            let reflect_messages = prompts::build_reflect_messages(
                task,
                &memory,
                &act.answer,
                &act.step_output,
                act.done,
            );
            let completion = self
                .client
                .complete_json(&model_config, &reflect_messages, &prompts::reflect_schema())
                .await?;
            let reflect: ReflectResponse =
                serde_json::from_value(completion.parsed).map_err(|e| AgentError::Parse {
                    phase: "reflect",
                    message: e.to_string(),
                })?;
            let reflect_usage = self
                .apply_usage(
                    execution,
                    &mut accountant,
                    &mut memory,
                    &mut tokens_in,
                    &mut tokens_out,
                    completion.usage,
                )
                .await?;

            let should_continue = reflect.should_continue
                || self.continuation_override(task, &act, step_index);
            if should_continue != reflect.should_continue {
                debug!(
                    task_id = %task.task_id,
                    step_index = step_index,
                    "Reflect decision overridden to continue"
                );
            }

            let reflect_record = StepRecord::Reflect {
                should_continue,
                summary: reflect.summary.clone(),
                plan_updates: reflect.plan_updates.clone(),
                confidence: reflect.confidence,
                stop_reason: reflect.stop_reason.clone(),
            };
            if self
                .persist_step(execution, step_index, &reflect_record, Some(reflect_usage.0))
                .await?
                .is_none()
            {
                stop_reason = Some(StopReason::Cancelled);
                break;
            }

            // -- memory update ---------------------------------------------
            let mut plan_texts = plan.plan_items.clone();
            merge_unique(&mut plan_texts, reflect.plan_updates.iter().cloned());
            memory.plan = plan_texts.into_iter().map(PlanItem::pending).collect();
            merge_unique(
                &mut memory.visited_sources,
                chunks
                    .iter()
                    .map(|c| format!("{}#{}", c.source_url, c.snippet_hash)),
            );
            merge_unique(&mut memory.facts, act.discovered_facts.iter().cloned());
            memory.facts = keep_tail(std::mem::take(&mut memory.facts), MEMORY_FACTS_KEEP);
            memory.step_summaries.push(reflect.summary.clone());
            memory.step_summaries =
                keep_tail(std::mem::take(&mut memory.step_summaries), MEMORY_SUMMARIES_KEEP);

            accountant.record_step();
            memory.current_step = accountant.steps_used();
            memory.remaining_budget = accountant.remaining();
            self.store.upsert_task_agent_state(&memory).await?;
            self.store
                .update_task_execution_progress(
                    &execution.id,
                    accountant.steps_used(),
                    tokens_in,
                    tokens_out,
                    accountant.cost_used(),
                )
                .await?;

            // -- termination precedence after reflect -----------------------
            if let Some(reason) = reflect_usage.1 {
                // Token exhaustion observed after the reflect call wins.
                stop_reason = Some(reason);
                break;
            }
            if act.done {
                stop_reason = Some(StopReason::Completed);
                break;
            }
            if !should_continue {
                stop_reason = Some(classify_reflect_stop(reflect.stop_reason.as_deref()));
                break;
            }
        }

        let stop_reason = stop_reason.unwrap_or(StopReason::StepLimit);
        info!(
            task_id = %task.task_id,
            worker = %worker.worker_label,
            stop_reason = %stop_reason,
            steps = accountant.steps_used(),
            "Agent loop finished"
        );

        Ok(AgentOutcome {
            attempt,
            stop_reason,
            step_count: accountant.steps_used(),
            evidence,
            tokens_in,
            tokens_out,
            cost_estimate: accountant.cost_used(),
        })
    }

    /// Applies one call's usage: execution counters, run cost, and memory
    /// budget. Returns the recorded usage and any termination the §4.3
    /// checks demand, in their order.
    async fn apply_usage(
        &self,
        execution: &TaskExecution,
        accountant: &mut BudgetAccountant,
        memory: &mut AgentMemoryState,
        tokens_in: &mut u64,
        tokens_out: &mut u64,
        usage: Usage,
    ) -> Result<(CallUsage, Option<StopReason>), AgentError> {
        let cost = self.pricing.call_cost_usd(&usage);
        accountant.apply(usage.total(), cost);
        *tokens_in += usage.input_tokens;
        *tokens_out += usage.output_tokens;

        self.store
            .update_task_execution_progress(
                &execution.id,
                accountant.steps_used(),
                *tokens_in,
                *tokens_out,
                accountant.cost_used(),
            )
            .await?;
        let run_total = self
            .store
            .increment_run_cost(&execution.run_id, cost)
            .await?;

        memory.remaining_budget = accountant.remaining();
        self.store.upsert_task_agent_state(memory).await?;

        let canceled = self.store.is_run_canceled(&execution.run_id).await?;
        let stop = accountant.check_after_call(canceled, run_total);

        Ok((
            CallUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_estimate: cost,
                latency_ms: 0,
            },
            stop,
        ))
    }

    /// Persists one step trace and emits its event. Returns `None` when
    /// the run closed underneath us (cancellation landed), which callers
    /// treat as a cancelled stop.
    async fn persist_step(
        &self,
        execution: &TaskExecution,
        step_index: u32,
        record: &StepRecord,
        usage: Option<CallUsage>,
    ) -> Result<Option<i64>, AgentError> {
        let step_id = match self
            .store
            .persist_task_step(&execution.id, step_index, record, usage)
            .await
        {
            Ok(id) => id,
            Err(StoreError::RunClosed { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        emit(
            self.store.as_ref(),
            &execution.run_id,
            event_types::TASK_STEP_CREATED,
            Some(execution.phase),
            format!("step {} {}", step_index, record.phase()),
            Some(serde_json::json!({
                "task_execution_id": execution.id,
                "step_id": step_id,
                "step_index": step_index,
                "step_phase": record.phase().to_string(),
            })),
        )
        .await?;

        Ok(Some(step_id))
    }

    /// The reflect override: a not-done act may not stop the loop early
    /// while the attempt is young, under-covered, uncited, or giving up.
    fn continuation_override(&self, task: &Task, act: &ActResponse, step_index: u32) -> bool {
        if act.done {
            return false;
        }
        if step_index < 2 {
            return true;
        }
        let combined = format!("{}\n{}", act.answer, act.step_output);
        if expected_signal_coverage(&task.expected_signals, &combined) < REFLECT_COVERAGE_FLOOR {
            return true;
        }
        if act.citations.is_empty() {
            return true;
        }
        self.giving_up.is_match(&combined)
    }
}

/// Builds the retrieval query from the task and agent memory.
fn build_query(task: &Task, memory: &AgentMemoryState) -> String {
    let mut parts: Vec<String> = vec![task.name.clone(), task.description.clone()];
    parts.extend(task.expected_signals.iter().cloned());
    parts.extend(
        memory
            .plan
            .iter()
            .filter(|item| !item.done)
            .map(|item| item.text.clone()),
    );
    let summaries = memory.step_summaries.len();
    parts.extend(
        memory.step_summaries[summaries.saturating_sub(2)..]
            .iter()
            .cloned(),
    );
    let facts = memory.facts.len();
    parts.extend(memory.facts[facts.saturating_sub(5)..].iter().cloned());
    parts.join("\n")
}

/// Classifies a reflect-initiated stop by its stop-reason string.
fn classify_reflect_stop(stop_reason: Option<&str>) -> StopReason {
    match stop_reason {
        Some(reason)
            if reason.contains("error") || reason.contains("stuck") || reason.contains("fail") =>
        {
            StopReason::Error
        }
        _ => StopReason::Completed,
    }
}

/// Appends items not already present, preserving order.
fn merge_unique(into: &mut Vec<String>, additions: impl IntoIterator<Item = String>) {
    for addition in additions {
        if !into.contains(&addition) {
            into.push(addition);
        }
    }
}

/// Keeps the last `keep` items.
fn keep_tail(items: Vec<String>, keep: usize) -> Vec<String> {
    let skip = items.len().saturating_sub(keep);
    items.into_iter().skip(skip).collect()
}
