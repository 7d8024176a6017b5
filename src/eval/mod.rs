//! Two-stage attempt evaluation.
//!
//! Deterministic guards compute provable pass-blocks and score caps
//! without a model call; the rubric judge then scores the attempt with
//! two schema-validated LLM calls. The aggregator folds per-task
//! evaluations into phase totals.

pub mod aggregate;
pub mod guard;
pub mod judge;

pub use aggregate::{aggregate, compute_delta};
pub use guard::{expected_signal_coverage, run_guard_checks, GuardInput, GuardOutcome, ScoreCaps};
pub use judge::{classify_failure, JudgeOutcome, RubricJudge};
