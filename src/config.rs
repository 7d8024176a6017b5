//! Run configuration: request validation, normalization, and defaults.
//!
//! A `RunRequest` is what callers submit; `RunConfig` is the immutable,
//! fully-defaulted form captured on the run at creation. Worker assignments
//! are rescaled so their quantities sum to the requested worker count.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ModelOverrides;

/// Default number of tasks synthesized per run.
pub const DEFAULT_MAX_TASKS: usize = 12;
/// Default iteration bound per task.
pub const DEFAULT_MAX_STEPS_PER_TASK: u32 = 8;
/// Default token bound per task execution.
pub const DEFAULT_MAX_TOKENS_PER_TASK: u64 = 60_000;
/// Default hard cost cap per run, in USD.
pub const DEFAULT_HARD_COST_CAP_USD: f64 = 5.0;
/// Default number of concurrent worker activities.
pub const DEFAULT_EXECUTION_CONCURRENCY: usize = 3;
/// Default number of concurrent judge calls.
pub const DEFAULT_JUDGE_CONCURRENCY: usize = 2;
/// Default model for worker agents.
pub const DEFAULT_RUN_MODEL: &str = "anthropic/claude-opus-4.5";
/// Default model for the rubric judge.
pub const DEFAULT_JUDGE_MODEL: &str = "anthropic/claude-opus-4.5";
/// Default provider slug for worker assignments.
pub const DEFAULT_PROVIDER: &str = "openrouter";
/// Default per-call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
/// Default transient-error retry count for model calls.
pub const DEFAULT_MODEL_RETRIES: u32 = 2;

/// Errors produced while validating a run request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("docs URL must not be empty")]
    EmptyDocsUrl,

    #[error("Invalid docs URL '{0}': expected http or https")]
    InvalidDocsUrl(String),

    #[error("'{field}' must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("Hard cost cap must be positive, got {0}")]
    InvalidCostCap(f64),

    #[error("Worker assignment {index} has empty model name")]
    EmptyAssignmentModel { index: usize },

    #[error("User task {index} has empty name")]
    EmptyTaskName { index: usize },
}

/// One entry in the worker assignment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub provider: String,
    pub model: String,
    pub quantity: usize,
    #[serde(default)]
    pub overrides: ModelOverrides,
}

impl WorkerAssignment {
    /// Creates an assignment for `quantity` workers of one model.
    pub fn new(provider: impl Into<String>, model: impl Into<String>, quantity: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            quantity,
            overrides: ModelOverrides::default(),
        }
    }
}

/// Worker provisioning request: how many workers, running which models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSpec {
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub assignments: Vec<WorkerAssignment>,
}

/// A caller-supplied task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTask {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub expected_signals: Vec<String>,
}

/// What callers submit to create a run. Every field except the docs URL
/// is optional and defaulted during normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub docs_url: String,
    #[serde(default)]
    pub task_count: Option<usize>,
    #[serde(default)]
    pub execution_concurrency: Option<usize>,
    #[serde(default)]
    pub judge_concurrency: Option<usize>,
    #[serde(default)]
    pub max_steps_per_task: Option<u32>,
    #[serde(default)]
    pub max_tokens_per_task: Option<u64>,
    #[serde(default)]
    pub hard_cost_cap_usd: Option<f64>,
    #[serde(default)]
    pub tie_break_enabled: Option<bool>,
    #[serde(default)]
    pub enable_skill_optimization: Option<bool>,
    #[serde(default)]
    pub run_model: Option<String>,
    #[serde(default)]
    pub judge_model: Option<String>,
    #[serde(default)]
    pub workers: Option<WorkerSpec>,
    #[serde(default)]
    pub tasks: Vec<UserTask>,
}

impl RunRequest {
    /// Creates a request for the given docs URL with all defaults.
    pub fn new(docs_url: impl Into<String>) -> Self {
        Self {
            docs_url: docs_url.into(),
            ..Default::default()
        }
    }
}

/// Immutable run configuration, captured at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub max_tasks: usize,
    pub max_steps_per_task: u32,
    pub max_tokens_per_task: u64,
    pub hard_cost_cap_usd: f64,
    pub execution_concurrency: usize,
    pub judge_concurrency: usize,
    pub tie_break_enabled: bool,
    pub enable_skill_optimization: bool,
    pub run_model: String,
    pub judge_model: String,
    pub timeout_ms: u64,
    pub model_retries: u32,
    pub worker_count: usize,
    pub assignments: Vec<WorkerAssignment>,
    pub user_tasks: Vec<UserTask>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            max_steps_per_task: DEFAULT_MAX_STEPS_PER_TASK,
            max_tokens_per_task: DEFAULT_MAX_TOKENS_PER_TASK,
            hard_cost_cap_usd: DEFAULT_HARD_COST_CAP_USD,
            execution_concurrency: DEFAULT_EXECUTION_CONCURRENCY,
            judge_concurrency: DEFAULT_JUDGE_CONCURRENCY,
            tie_break_enabled: true,
            enable_skill_optimization: false,
            run_model: DEFAULT_RUN_MODEL.to_string(),
            judge_model: DEFAULT_JUDGE_MODEL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            model_retries: DEFAULT_MODEL_RETRIES,
            worker_count: 1,
            assignments: vec![WorkerAssignment::new(DEFAULT_PROVIDER, DEFAULT_RUN_MODEL, 1)],
            user_tasks: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Validates a request and normalizes it into a full configuration.
    ///
    /// Worker assignments are rescaled so `sum(quantity) == worker_count`;
    /// a missing assignment table becomes a single assignment of the run
    /// model for every worker.
    pub fn from_request(request: &RunRequest) -> Result<Self, ConfigError> {
        let docs_url = request.docs_url.trim();
        if docs_url.is_empty() {
            return Err(ConfigError::EmptyDocsUrl);
        }
        if !docs_url.starts_with("http://") && !docs_url.starts_with("https://") {
            return Err(ConfigError::InvalidDocsUrl(docs_url.to_string()));
        }

        let max_tasks = request.task_count.unwrap_or(DEFAULT_MAX_TASKS);
        if max_tasks == 0 {
            return Err(ConfigError::NonPositive { field: "task_count" });
        }

        let max_steps_per_task = request
            .max_steps_per_task
            .unwrap_or(DEFAULT_MAX_STEPS_PER_TASK);
        if max_steps_per_task == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_steps_per_task",
            });
        }

        let max_tokens_per_task = request
            .max_tokens_per_task
            .unwrap_or(DEFAULT_MAX_TOKENS_PER_TASK);
        if max_tokens_per_task == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_tokens_per_task",
            });
        }

        let hard_cost_cap_usd = request
            .hard_cost_cap_usd
            .unwrap_or(DEFAULT_HARD_COST_CAP_USD);
        if hard_cost_cap_usd <= 0.0 || !hard_cost_cap_usd.is_finite() {
            return Err(ConfigError::InvalidCostCap(hard_cost_cap_usd));
        }

        let execution_concurrency = request
            .execution_concurrency
            .unwrap_or(DEFAULT_EXECUTION_CONCURRENCY)
            .max(1);
        let judge_concurrency = request
            .judge_concurrency
            .unwrap_or(DEFAULT_JUDGE_CONCURRENCY)
            .max(1);

        let run_model = request
            .run_model
            .clone()
            .unwrap_or_else(|| DEFAULT_RUN_MODEL.to_string());
        let judge_model = request
            .judge_model
            .clone()
            .unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string());

        for (index, task) in request.tasks.iter().enumerate() {
            if task.name.trim().is_empty() {
                return Err(ConfigError::EmptyTaskName { index });
            }
        }

        let spec = request.workers.clone().unwrap_or_default();
        for (index, assignment) in spec.assignments.iter().enumerate() {
            if assignment.model.trim().is_empty() {
                return Err(ConfigError::EmptyAssignmentModel { index });
            }
        }

        let worker_count = spec
            .worker_count
            .unwrap_or_else(|| {
                let assigned: usize = spec.assignments.iter().map(|a| a.quantity).sum();
                assigned.max(1)
            })
            .max(1);

        let assignments = if spec.assignments.is_empty() {
            vec![WorkerAssignment::new(
                DEFAULT_PROVIDER,
                run_model.clone(),
                worker_count,
            )]
        } else {
            rescale_assignments(&spec.assignments, worker_count)
        };

        Ok(Self {
            max_tasks,
            max_steps_per_task,
            max_tokens_per_task,
            hard_cost_cap_usd,
            execution_concurrency,
            judge_concurrency,
            tie_break_enabled: request.tie_break_enabled.unwrap_or(true),
            enable_skill_optimization: request.enable_skill_optimization.unwrap_or(false),
            run_model,
            judge_model,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            model_retries: DEFAULT_MODEL_RETRIES,
            worker_count,
            assignments,
            user_tasks: request.tasks.clone(),
        })
    }
}

/// Rescales assignment quantities to sum exactly to `worker_count` using
/// largest-remainder apportionment over the requested proportions.
/// Assignments with zero requested quantity are dropped unless every
/// quantity is zero, in which case workers are spread evenly.
fn rescale_assignments(
    assignments: &[WorkerAssignment],
    worker_count: usize,
) -> Vec<WorkerAssignment> {
    let requested: usize = assignments.iter().map(|a| a.quantity).sum();

    let weights: Vec<f64> = if requested == 0 {
        vec![1.0; assignments.len()]
    } else {
        assignments.iter().map(|a| a.quantity as f64).collect()
    };
    let total_weight: f64 = weights.iter().sum();

    let mut scaled: Vec<(usize, usize, f64)> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let exact = w / total_weight * worker_count as f64;
            (i, exact.floor() as usize, exact - exact.floor())
        })
        .collect();

    let mut allocated: usize = scaled.iter().map(|(_, floor, _)| floor).sum();

    // Hand out the leftover slots to the largest remainders, index order
    // breaking ties so the result is deterministic.
    let mut by_remainder: Vec<usize> = (0..scaled.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        scaled[b]
            .2
            .partial_cmp(&scaled[a].2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &idx in by_remainder.iter().cycle().take(scaled.len() * 2) {
        if allocated >= worker_count {
            break;
        }
        scaled[idx].1 += 1;
        allocated += 1;
    }

    assignments
        .iter()
        .zip(scaled.iter())
        .filter(|(_, (_, quantity, _))| *quantity > 0)
        .map(|(assignment, (_, quantity, _))| WorkerAssignment {
            provider: assignment.provider.clone(),
            model: assignment.model.clone(),
            quantity: *quantity,
            overrides: assignment.overrides.clone(),
        })
        .collect()
}
