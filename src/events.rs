//! Run event log: type constants and append/stream helpers.
//!
//! Every phase transition, per-step persist, worker start/stop, error, and
//! cancel produces an event. Appends are durable before returning; readers
//! cursor by the globally-ordered insertion `id`, never by the per-run
//! `seq` (which is dense and unique but not the delivery cursor).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::store::{Store, StoreError};
use crate::types::{EventPayload, RunEvent, RunPhase};

/// Dot-notation event types.
pub mod event_types {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_INGESTING: &str = "run.ingesting";
    pub const RUN_GENERATING_TASKS: &str = "run.generating_tasks";
    pub const RUN_RUNNING: &str = "run.running";
    pub const RUN_EVALUATING: &str = "run.evaluating";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELED: &str = "run.canceled";
    pub const PHASE_STARTED: &str = "phase.started";
    pub const PHASE_COMPLETED: &str = "phase.completed";
    pub const WORKER_STARTED: &str = "worker.started";
    pub const WORKER_STOPPED: &str = "worker.stopped";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_STEP_CREATED: &str = "task.step.created";
    pub const TASK_EXECUTION_COMPLETED: &str = "task.execution.completed";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_ERROR: &str = "task.error";
    pub const SKILL_GENERATION_STARTED: &str = "skill.generation.started";
    pub const SKILL_GENERATION_COMPLETED: &str = "skill.generation.completed";
    pub const SKILL_GENERATION_FAILED: &str = "skill.generation.failed";
}

/// Returns true for the event types that signal stream completion.
pub fn is_terminal_event(event_type: &str) -> bool {
    matches!(
        event_type,
        event_types::RUN_COMPLETED | event_types::RUN_FAILED | event_types::RUN_CANCELED
    )
}

/// Appends an event with a structured payload.
pub async fn emit(
    store: &dyn Store,
    run_id: &str,
    event_type: &str,
    phase: Option<RunPhase>,
    message: impl Into<String>,
    data: Option<serde_json::Value>,
) -> Result<RunEvent, StoreError> {
    let payload = EventPayload {
        run_id: run_id.to_string(),
        phase,
        message: message.into(),
        data,
    };
    store.append_run_event(run_id, event_type, &payload).await
}

/// Poll interval for the event stream reader.
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Batch size per stream poll.
const STREAM_BATCH: usize = 256;

/// Streams a run's events starting after `after_id`.
///
/// The reader cursors by event id, polls until it delivers a terminal
/// `run.{completed|failed|canceled}` event, then closes the channel.
pub fn stream_events(
    store: Arc<dyn Store>,
    run_id: String,
    after_id: i64,
) -> mpsc::Receiver<RunEvent> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut cursor = after_id;
        loop {
            let batch = match store
                .get_run_events_after(&run_id, cursor, STREAM_BATCH)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Event stream read failed");
                    break;
                }
            };

            let mut saw_terminal = false;
            for event in batch {
                cursor = event.id;
                saw_terminal = saw_terminal || is_terminal_event(&event.event_type);
                if tx.send(event).await.is_err() {
                    // Receiver dropped; stop polling.
                    return;
                }
            }
            if saw_terminal {
                break;
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::store::MemoryStore;
    use crate::types::Run;

    #[test]
    fn test_terminal_event_detection() {
        assert!(is_terminal_event("run.completed"));
        assert!(is_terminal_event("run.failed"));
        assert!(is_terminal_event("run.canceled"));
        assert!(!is_terminal_event("task.step.created"));
        assert!(!is_terminal_event("run.started"));
    }

    #[tokio::test]
    async fn test_emit_appends_payload() {
        let store = MemoryStore::new();
        let run = Run::new("https://docs.example.com", RunConfig::default());
        store.create_run(&run).await.unwrap();

        let event = emit(
            &store,
            &run.id,
            event_types::RUN_STARTED,
            Some(RunPhase::Baseline),
            "run started",
            None,
        )
        .await
        .unwrap();

        assert_eq!(event.event_type, "run.started");
        assert_eq!(event.seq, 1);
        assert_eq!(event.payload.phase, Some(RunPhase::Baseline));
    }

    #[tokio::test]
    async fn test_stream_delivers_and_closes_on_terminal() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let run = Run::new("https://docs.example.com", RunConfig::default());
        store.create_run(&run).await.unwrap();

        emit(store.as_ref(), &run.id, event_types::RUN_STARTED, None, "start", None)
            .await
            .unwrap();
        emit(store.as_ref(), &run.id, event_types::RUN_COMPLETED, None, "done", None)
            .await
            .unwrap();

        let mut rx = stream_events(Arc::clone(&store), run.id.clone(), 0);
        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event.event_type);
        }
        assert_eq!(types, vec!["run.started", "run.completed"]);
    }

    #[tokio::test]
    async fn test_stream_respects_cursor() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let run = Run::new("https://docs.example.com", RunConfig::default());
        store.create_run(&run).await.unwrap();

        let first = emit(store.as_ref(), &run.id, "a.one", None, "one", None)
            .await
            .unwrap();
        emit(store.as_ref(), &run.id, event_types::RUN_CANCELED, None, "cancel", None)
            .await
            .unwrap();

        let mut rx = stream_events(Arc::clone(&store), run.id.clone(), first.id);
        let mut ids = Vec::new();
        while let Some(event) = rx.recv().await {
            ids.push(event.id);
        }
        assert_eq!(ids.len(), 1);
        assert!(ids[0] > first.id);
    }
}
