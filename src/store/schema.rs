//! SQL schema for the Postgres store.
//!
//! Statements are idempotent (`IF NOT EXISTS`) so migration runs can be
//! repeated safely. Column names are contracts shared with the entity
//! encode/decode layer in `postgres.rs`.

/// All DDL statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            docs_url TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            config JSONB NOT NULL,
            totals JSONB,
            cost_estimate DOUBLE PRECISION NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS run_artifacts (
            id BIGSERIAL PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            artifact_type TEXT NOT NULL,
            source_url TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            metadata JSONB
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_run_artifacts_run ON run_artifacts (run_id)",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            difficulty TEXT NOT NULL,
            expected_signals JSONB NOT NULL,
            status TEXT NOT NULL,
            position BIGINT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks (run_id)",
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            worker_label TEXT NOT NULL,
            model_provider TEXT NOT NULL,
            model_name TEXT NOT NULL,
            model_config JSONB NOT NULL,
            status TEXT NOT NULL,
            UNIQUE (run_id, worker_label)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_workers_run ON workers (run_id)",
        r#"
        CREATE TABLE IF NOT EXISTS task_executions (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            task_id TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            status TEXT NOT NULL,
            step_count BIGINT NOT NULL DEFAULT 0,
            tokens_in BIGINT NOT NULL DEFAULT 0,
            tokens_out BIGINT NOT NULL DEFAULT 0,
            cost_estimate DOUBLE PRECISION NOT NULL DEFAULT 0,
            stop_reason TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_task_executions_run ON task_executions (run_id)",
        "CREATE INDEX IF NOT EXISTS idx_task_executions_run_task ON task_executions (run_id, task_id)",
        r#"
        CREATE TABLE IF NOT EXISTS task_agent_state (
            task_execution_id TEXT PRIMARY KEY REFERENCES task_executions(id),
            state JSONB NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_steps (
            id BIGSERIAL PRIMARY KEY,
            task_execution_id TEXT NOT NULL REFERENCES task_executions(id),
            step_index BIGINT NOT NULL,
            phase TEXT NOT NULL,
            record JSONB NOT NULL,
            usage JSONB,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_task_steps_execution ON task_steps (task_execution_id, id)",
        r#"
        CREATE TABLE IF NOT EXISTS step_citations (
            id BIGSERIAL PRIMARY KEY,
            step_id BIGINT NOT NULL REFERENCES task_steps(id),
            source TEXT NOT NULL,
            snippet_hash TEXT,
            excerpt TEXT NOT NULL,
            start_offset BIGINT,
            end_offset BIGINT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_step_citations_step ON step_citations (step_id)",
        r#"
        CREATE TABLE IF NOT EXISTS deterministic_checks (
            id BIGSERIAL PRIMARY KEY,
            task_execution_id TEXT NOT NULL REFERENCES task_executions(id),
            name TEXT NOT NULL,
            passed BOOLEAN NOT NULL,
            score_delta DOUBLE PRECISION NOT NULL,
            details TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_deterministic_checks_execution ON deterministic_checks (task_execution_id)",
        r#"
        CREATE TABLE IF NOT EXISTS task_attempts (
            task_execution_id TEXT PRIMARY KEY REFERENCES task_executions(id),
            attempt JSONB NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS task_evaluations (
            id BIGSERIAL PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            task_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            evaluation JSONB NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_task_evaluations_run_task ON task_evaluations (run_id, task_id)",
        r#"
        CREATE TABLE IF NOT EXISTS run_events (
            id BIGSERIAL PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            seq BIGINT NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (run_id, seq)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_run_events_run_id ON run_events (run_id, id)",
        r#"
        CREATE TABLE IF NOT EXISTS run_errors (
            id BIGSERIAL PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            scope TEXT NOT NULL,
            message TEXT NOT NULL,
            data JSONB,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_run_errors_run ON run_errors (run_id)",
        r#"
        CREATE TABLE IF NOT EXISTS skill_optimization_sessions (
            run_id TEXT PRIMARY KEY REFERENCES runs(id),
            session JSONB NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS skill_artifacts (
            id BIGSERIAL PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            content_hash TEXT NOT NULL,
            markdown TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (run_id, content_hash)
        )
        "#,
    ]
}
