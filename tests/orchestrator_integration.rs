//! End-to-end orchestrator scenarios against the in-memory store with a
//! scripted model client and a stub ingestor.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use docforge::config::{RunRequest, UserTask, WorkerAssignment, WorkerSpec};
use docforge::error::{IngestError, LlmError};
use docforge::ingest::{Artifact, ArtifactType, IngestOptions, IngestionResult, Ingestor};
use docforge::llm::{
    FlatRateCost, JsonCompletion, JsonSchema, Message, ModelClient, ModelConfig, TextCompletion,
    Usage,
};
use docforge::orchestrator::Orchestrator;
use docforge::retrieval::RetrievalIndex;
use docforge::store::{MemoryStore, Store};
use docforge::types::{RunStatus, StopReason, TaskStatus};

const DOCS_URL: &str = "https://docs.example.com";
const AUTH_PAGE: &str = "https://docs.example.com/auth";
const AUTH_CONTENT: &str =
    "Authenticate with an api key sent in the authorization header of every request.";

/// Ingestor returning a fixed artifact set.
struct StubIngestor {
    artifacts: Vec<Artifact>,
}

#[async_trait]
impl Ingestor for StubIngestor {
    async fn ingest(
        &self,
        docs_url: &str,
        _options: &IngestOptions,
    ) -> Result<IngestionResult, IngestError> {
        Ok(IngestionResult {
            normalized_docs_url: docs_url.to_string(),
            artifacts: self.artifacts.clone(),
            ..Default::default()
        })
    }
}

/// Model client that replays canned JSON responses per schema name.
struct ScriptedClient {
    responses: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
    usage: Usage,
    delay: Mutex<Duration>,
}

impl ScriptedClient {
    fn new(usage: Usage) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            usage,
            delay: Mutex::new(Duration::ZERO),
        }
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn push(&self, schema: &str, value: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .push_back(value);
    }

    fn push_many(&self, schema: &str, value: serde_json::Value, count: usize) {
        for _ in 0..count {
            self.push(schema, value.clone());
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete_text(
        &self,
        _config: &ModelConfig,
        _messages: &[Message],
    ) -> Result<TextCompletion, LlmError> {
        Ok(TextCompletion {
            text: String::new(),
            usage: self.usage,
            latency_ms: 1,
            model: "scripted".to_string(),
        })
    }

    async fn complete_json(
        &self,
        _config: &ModelConfig,
        _messages: &[Message],
        schema: &JsonSchema,
    ) -> Result<JsonCompletion, LlmError> {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let parsed = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&schema.name)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| LlmError::RequestFailed(format!("script exhausted: {}", schema.name)))?;
        Ok(JsonCompletion {
            parsed,
            text: String::new(),
            usage: self.usage,
            latency_ms: 1,
            model: "scripted".to_string(),
        })
    }
}

fn auth_artifact() -> Artifact {
    Artifact::new(ArtifactType::Page, AUTH_PAGE, AUTH_CONTENT)
}

/// The auth chunk's `(source, snippet_hash)` as the index will see it.
fn auth_chunk_identity() -> (String, String) {
    let index = RetrievalIndex::build(&[auth_artifact()]);
    let hit = &index.retrieve("api key authorization header", 1)[0];
    (hit.source_url.clone(), hit.snippet_hash.clone())
}

fn plan_response() -> serde_json::Value {
    json!({"plan_items": ["read the auth docs", "write the steps"], "rationale": "auth first"})
}

fn act_response(done: bool, citations: bool) -> serde_json::Value {
    let citation_list = if citations {
        let (source, hash) = auth_chunk_identity();
        json!([{ "source": source, "snippet_hash": hash, "excerpt": AUTH_CONTENT }])
    } else {
        json!([])
    };
    json!({
        "answer": "Create an api key, then send it in the authorization header.",
        "step_output": "Documented the header-based authentication flow.",
        "citations": citation_list,
        "done": done,
        "done_reason": "answer covers the task",
        "discovered_facts": ["keys are created in the dashboard"]
    })
}

fn reflect_response(should_continue: bool) -> serde_json::Value {
    json!({
        "should_continue": should_continue,
        "summary": "progressed on the auth task",
        "plan_updates": [],
        "confidence": 0.8,
        "stop_reason": "completed"
    })
}

fn alignment_response(supported: bool) -> serde_json::Value {
    json!({
        "is_supported_by_evidence": supported,
        "unsupported_claims": [],
        "notes": "checked against the excerpts"
    })
}

fn rubric_response(score: f64, failure_class: Option<&str>) -> serde_json::Value {
    json!({
        "scores": {
            "completeness": score,
            "correctness": score,
            "groundedness": score,
            "actionability": score
        },
        "rationale": "scored by script",
        "confidence": 0.9,
        "suggested_failure_class": failure_class
    })
}

fn auth_user_task() -> UserTask {
    UserTask {
        name: "Authenticate".to_string(),
        description: "Authenticate a request against the API".to_string(),
        category: Some("authentication".to_string()),
        difficulty: Some("medium".to_string()),
        expected_signals: vec!["api key".to_string(), "authorization header".to_string()],
    }
}

fn single_worker_request(task_count: usize) -> RunRequest {
    let mut request = RunRequest::new(DOCS_URL);
    request.task_count = Some(task_count);
    request.execution_concurrency = Some(1);
    request.judge_concurrency = Some(1);
    request.workers = Some(WorkerSpec {
        worker_count: Some(1),
        assignments: vec![WorkerAssignment::new("openrouter", "scripted-model", 1)],
    });
    request
}

struct Harness {
    store: Arc<MemoryStore>,
    client: Arc<ScriptedClient>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(usage: Usage, artifacts: Vec<Artifact>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::new(usage));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(StubIngestor { artifacts }),
        Arc::clone(&client) as Arc<dyn ModelClient>,
        Arc::new(FlatRateCost::default()),
    ));
    Harness {
        store,
        client,
        orchestrator,
    }
}

/// Polls until the run reaches a terminal status.
async fn wait_terminal(store: &MemoryStore, run_id: &str) -> RunStatus {
    for _ in 0..600 {
        let run = store.get_run(run_id).await.unwrap();
        if run.status.is_terminal() && run.ended_at.is_some() {
            return run.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run '{}' did not reach a terminal status", run_id);
}

#[tokio::test]
async fn happy_path_single_task_single_worker() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    // Two iterations so the attempt carries two answer steps; the second
    // act reports done.
    hx.client.push_many("plan", plan_response(), 2);
    hx.client.push("act", act_response(false, true));
    hx.client.push("act", act_response(true, true));
    hx.client.push_many("reflect", reflect_response(false), 2);
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(9.0, None));

    let mut request = single_worker_request(1);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    assert!(hx.orchestrator.clone().start_run_in_background(&run_id));
    // A duplicate start while in flight is rejected
    assert!(!hx.orchestrator.clone().start_run_in_background(&run_id));

    let status = wait_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Completed);

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    assert_eq!(detail.tasks.len(), 1);
    assert_eq!(detail.tasks[0].status, TaskStatus::Passed);

    assert_eq!(detail.baseline_evaluations.len(), 1);
    let evaluation = &detail.baseline_evaluations[0];
    assert!(evaluation.pass);
    assert!(evaluation.quality_pass);
    assert!(evaluation.validity_pass);
    assert!(evaluation.failure_class.is_none());
    assert!(evaluation.average_score >= 7.0);

    assert_eq!(detail.executions.len(), 1);
    let checks = hx
        .store
        .list_deterministic_checks(&detail.executions[0].id)
        .await
        .unwrap();
    assert_eq!(checks.len(), 5);
    assert!(checks.iter().all(|c| c.passed), "checks: {:?}", checks);

    // Run cost equals the sum of execution costs
    let run = detail.run;
    let execution_cost: f64 = detail.executions.iter().map(|e| e.cost_estimate).sum();
    assert!((run.cost_estimate - execution_cost).abs() < 1e-6);
    assert!(run.totals.is_some());
    assert_eq!(run.totals.unwrap().passed_tasks, 1);
}

#[tokio::test]
async fn missing_citations_block_pass() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    // Three iterations: the reflect override keeps the loop alive while
    // the attempt is young and uncited; the third act finishes.
    for _ in 0..3 {
        hx.client.push("plan", plan_response());
        hx.client.push("reflect", reflect_response(false));
    }
    hx.client.push("act", act_response(false, false));
    hx.client.push("act", act_response(false, false));
    hx.client.push("act", act_response(true, false));
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(9.0, None));

    let mut request = single_worker_request(1);
    // The capped average lands in the tie-break band; keep a single
    // scripted rubric call.
    request.tie_break_enabled = Some(false);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    let status = wait_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Completed);

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    let evaluation = &detail.baseline_evaluations[0];

    // High rubric scores cannot rescue a citation-free attempt
    assert!(!evaluation.pass);
    assert!(!evaluation.validity_pass);
    assert!(evaluation
        .validity_blocked_reasons
        .contains(&"missing_citations".to_string()));
    assert!(evaluation.criterion_scores.groundedness <= 3.0);
    assert_eq!(detail.tasks[0].status, TaskStatus::Failed);

    let checks = hx
        .store
        .list_deterministic_checks(&detail.executions[0].id)
        .await
        .unwrap();
    let presence = checks.iter().find(|c| c.name == "citation_presence").unwrap();
    assert!(!presence.passed);

    // The completion event carries pass=false
    let events = hx.store.get_run_events_after(&run_id, 0, 10_000).await.unwrap();
    let completed = events
        .iter()
        .find(|e| e.event_type == "task.execution.completed")
        .expect("completion event present");
    assert_eq!(completed.payload.data.as_ref().unwrap()["pass"], false);
}

#[tokio::test]
async fn cost_cap_skips_remaining_tasks() {
    // Each call prices at $0.00025 (500 input tokens at $0.5/1M): the
    // first task's five calls total $0.00125, crossing the $0.001 cap.
    let hx = harness(
        Usage {
            input_tokens: 500,
            output_tokens: 0,
        },
        vec![auth_artifact()],
    );
    hx.client.push("plan", plan_response());
    hx.client.push("act", act_response(true, true));
    hx.client.push("reflect", reflect_response(false));
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(9.0, None));

    let mut request = single_worker_request(3);
    request.hard_cost_cap_usd = Some(0.001);
    request.tasks = vec![
        auth_user_task(),
        UserTask {
            name: "Configure the SDK".to_string(),
            description: "Configure the documented SDK options".to_string(),
            category: None,
            difficulty: None,
            expected_signals: vec![],
        },
        UserTask {
            name: "Handle errors".to_string(),
            description: "Handle the documented error codes".to_string(),
            category: None,
            difficulty: None,
            expected_signals: vec![],
        },
    ];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    let status = wait_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Completed);

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    assert_eq!(detail.executions.len(), 3);

    // First task evaluated; the remaining two skipped on the cost cap
    // with no evaluation rows.
    let skipped: Vec<_> = detail
        .executions
        .iter()
        .filter(|e| e.status == TaskStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 2);
    assert!(skipped
        .iter()
        .all(|e| e.stop_reason == Some(StopReason::CostLimit)));
    assert_eq!(detail.baseline_evaluations.len(), 1);

    let run = detail.run;
    assert!(run.cost_estimate >= 0.001);
}

#[tokio::test]
async fn cancellation_mid_execution() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    // Enough scripted iterations that the run is still working when the
    // cancel lands; the agent never reports done, and each model call
    // takes long enough for the cancel to land mid-execution.
    hx.client.push_many("plan", plan_response(), 12);
    hx.client.push_many("act", act_response(false, true), 12);
    hx.client.push_many("reflect", reflect_response(true), 12);
    hx.client.set_delay(Duration::from_millis(50));

    let mut request = single_worker_request(1);
    request.max_steps_per_task = Some(8);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    let mut events = hx.orchestrator.stream_events(&run_id, 0);
    hx.orchestrator.clone().start_run_in_background(&run_id);

    // Cancel as soon as the first step trace lands
    while let Some(event) = events.recv().await {
        if event.event_type == "task.step.created" {
            hx.orchestrator.cancel_run(&run_id).await.unwrap();
            break;
        }
    }

    let status = wait_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Canceled);

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    assert_eq!(detail.executions.len(), 1);
    assert_eq!(detail.executions[0].status, TaskStatus::Skipped);
    assert_eq!(detail.executions[0].stop_reason, Some(StopReason::Cancelled));
    assert_eq!(detail.tasks[0].status, TaskStatus::Skipped);
    // No evaluation ever happened, so totals stay null
    assert!(detail.run.totals.is_none());
    assert!(detail.baseline_evaluations.is_empty());

    // Cancellation liveness: no step event is newer than the cancel event
    let events = hx.store.get_run_events_after(&run_id, 0, 10_000).await.unwrap();
    let cancel_id = events
        .iter()
        .find(|e| e.event_type == "run.canceled")
        .map(|e| e.id)
        .expect("cancel event present");
    assert!(events
        .iter()
        .filter(|e| e.event_type == "task.step.created")
        .all(|e| e.id < cancel_id));
}

#[tokio::test]
async fn optimization_uplift_reruns_all_tasks() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );

    // Baseline: three tasks, one passes and two fail.
    for score in [9.0, 3.0, 3.0] {
        hx.client.push("plan", plan_response());
        hx.client.push("act", act_response(true, true));
        hx.client.push("reflect", reflect_response(false));
        hx.client.push("alignment", alignment_response(true));
        hx.client
            .push("rubric", rubric_response(score, Some("missing_examples")));
    }

    // The generated skill names every missed signal and all sections.
    hx.client.push(
        "optimized_skill",
        json!({
            "optimized_skill_markdown": "# Purpose\nGuide agents.\n\n# Retrieval Strategy\n\
                Search for api key, authorization header, sdk options, error codes.\n\n\
                # Critical Workflows\nAuthentication first.\n\n# Failure Prevention\n\
                Always cite excerpts.\n\n# Verification Checklist\n- citations present",
            "optimization_notes": ["cover authentication signals"]
        }),
    );

    // Optimized: all three pass.
    for _ in 0..3 {
        hx.client.push("plan", plan_response());
        hx.client.push("act", act_response(true, true));
        hx.client.push("reflect", reflect_response(false));
        hx.client.push("alignment", alignment_response(true));
        hx.client.push("rubric", rubric_response(9.0, None));
    }

    let mut request = single_worker_request(3);
    request.enable_skill_optimization = Some(true);
    request.tasks = vec![
        auth_user_task(),
        UserTask {
            name: "Configure the SDK".to_string(),
            description: "Configure the documented SDK options".to_string(),
            category: None,
            difficulty: None,
            expected_signals: vec![],
        },
        UserTask {
            name: "Handle errors".to_string(),
            description: "Handle the documented error codes".to_string(),
            category: None,
            difficulty: None,
            expected_signals: vec![],
        },
    ];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    let status = wait_terminal(&hx.store, &run_id).await;
    assert_eq!(status, RunStatus::Completed);

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    assert_eq!(detail.baseline_evaluations.len(), 3);
    assert_eq!(detail.optimized_evaluations.len(), 3);

    let session = detail.session.expect("session present");
    assert_eq!(
        session.status,
        docforge::types::SessionStatus::Completed
    );
    let baseline_totals = session.baseline_totals.unwrap();
    let optimized_totals = session.optimized_totals.unwrap();
    assert_eq!(baseline_totals.passed_tasks, 1);
    assert_eq!(optimized_totals.passed_tasks, 3);

    let delta = session.delta.unwrap();
    assert_eq!(delta.passed_tasks_delta, 2);
    assert!((delta.pass_rate_delta - 0.6667).abs() < 1e-9);

    // The run finalizes with the optimized totals
    let totals = detail.run.totals.unwrap();
    assert_eq!(totals.passed_tasks, 3);
    assert_eq!(totals.failed_tasks, 0);
}

#[tokio::test]
async fn optimization_skipped_without_failures() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    hx.client.push("plan", plan_response());
    hx.client.push("act", act_response(true, true));
    hx.client.push("reflect", reflect_response(false));
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(9.0, None));

    let mut request = single_worker_request(1);
    request.enable_skill_optimization = Some(true);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    wait_terminal(&hx.store, &run_id).await;

    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    let session = detail.session.expect("session present");
    assert_eq!(session.status, docforge::types::SessionStatus::Skipped);
    assert!(detail.optimized_evaluations.is_empty());
    // Baseline totals are authoritative
    assert_eq!(detail.run.totals.unwrap().passed_tasks, 1);
}

#[tokio::test]
async fn skill_generation_failure_finalizes_with_baseline() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    // One failing baseline task; no scripted skill response, so the
    // generation call errors out.
    hx.client.push("plan", plan_response());
    hx.client.push("act", act_response(true, true));
    hx.client.push("reflect", reflect_response(false));
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(3.0, Some("missing_content")));

    let mut request = single_worker_request(1);
    request.enable_skill_optimization = Some(true);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    let status = wait_terminal(&hx.store, &run_id).await;

    // The run still completes, with baseline totals
    assert_eq!(status, RunStatus::Completed);
    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    let session = detail.session.expect("session present");
    assert_eq!(session.status, docforge::types::SessionStatus::Error);
    assert!(session.error_message.is_some());
    assert_eq!(detail.run.totals.unwrap().failed_tasks, 1);
    assert!(detail
        .errors
        .iter()
        .any(|e| e.scope == docforge::types::RunErrorScope::SkillOptimizationError));
}

#[tokio::test]
async fn execution_error_produces_fallback_evaluation() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    // No scripted plan response: the first model call fails and the task
    // becomes an execution error with a fallback evaluation.
    let mut request = single_worker_request(1);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    hx.orchestrator.clone().start_run_in_background(&run_id);
    let status = wait_terminal(&hx.store, &run_id).await;

    // Per-task errors never fail the run
    assert_eq!(status, RunStatus::Completed);
    let detail = hx.orchestrator.get_run_detail(&run_id).await.unwrap();
    assert_eq!(detail.tasks[0].status, TaskStatus::Error);
    assert_eq!(detail.executions[0].status, TaskStatus::Error);

    let evaluation = &detail.baseline_evaluations[0];
    assert!(!evaluation.pass);
    assert_eq!(evaluation.average_score, 0.0);
    assert_eq!(
        evaluation.failure_class,
        Some(docforge::types::FailureClass::PoorStructure)
    );
    assert!(detail
        .errors
        .iter()
        .any(|e| e.scope == docforge::types::RunErrorScope::TaskExecutionError));
}

#[tokio::test]
async fn event_stream_terminates_and_orders() {
    let hx = harness(
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        },
        vec![auth_artifact()],
    );
    hx.client.push("plan", plan_response());
    hx.client.push("act", act_response(true, true));
    hx.client.push("reflect", reflect_response(false));
    hx.client.push("alignment", alignment_response(true));
    hx.client.push("rubric", rubric_response(9.0, None));

    let mut request = single_worker_request(1);
    request.tasks = vec![auth_user_task()];

    let run_id = hx.orchestrator.create_run(&request).await.unwrap();
    let mut stream = hx.orchestrator.stream_events(&run_id, 0);
    hx.orchestrator.clone().start_run_in_background(&run_id);

    let mut collected = Vec::new();
    while let Some(event) = stream.recv().await {
        collected.push(event);
    }

    // Strictly increasing ids and dense per-run seq
    assert!(collected.windows(2).all(|w| w[0].id < w[1].id));
    let seqs: Vec<i64> = collected.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=collected.len() as i64).collect::<Vec<_>>());

    // Lifecycle events appear in order, completion last
    let types: Vec<&str> = collected.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"run.created"));
    assert_eq!(types.last(), Some(&"run.completed"));
    assert!(types.contains(&"run.ingesting"));
    assert!(types.contains(&"worker.started"));
    assert!(types.contains(&"task.step.created"));
    assert!(types.contains(&"task.execution.completed"));
}
