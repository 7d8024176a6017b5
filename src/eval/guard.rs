//! Deterministic guard checks.
//!
//! Non-LLM gates over provable properties of an attempt. Each check
//! produces a persisted result; failures impose per-criterion score caps
//! and may add validity-block reasons that force `pass = false` no matter
//! what the rubric says.

use crate::retrieval::RetrievalIndex;
use crate::types::{CriterionScores, DeterministicCheck, StopReason, Task, TaskAttempt};

/// Minimum expected-signal coverage to pass the coverage check.
pub const SIGNAL_COVERAGE_THRESHOLD: f64 = 0.45;

/// Per-criterion caps imposed by failed checks. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreCaps {
    pub completeness: Option<f64>,
    pub correctness: Option<f64>,
    pub groundedness: Option<f64>,
    pub actionability: Option<f64>,
}

impl ScoreCaps {
    /// Tightens a cap to the minimum of the existing and new value.
    fn cap(slot: &mut Option<f64>, value: f64) {
        *slot = Some(slot.map_or(value, |existing| existing.min(value)));
    }

    /// Applies the caps to a score set.
    pub fn apply(&self, mut scores: CriterionScores) -> CriterionScores {
        if let Some(cap) = self.completeness {
            scores.completeness = scores.completeness.min(cap);
        }
        if let Some(cap) = self.correctness {
            scores.correctness = scores.correctness.min(cap);
        }
        if let Some(cap) = self.groundedness {
            scores.groundedness = scores.groundedness.min(cap);
        }
        if let Some(cap) = self.actionability {
            scores.actionability = scores.actionability.min(cap);
        }
        scores
    }
}

/// What the guard evaluates: the task, the attempt, and how it ran.
pub struct GuardInput<'a> {
    pub task: &'a Task,
    pub attempt: &'a TaskAttempt,
    pub step_count: u32,
    pub stop_reason: StopReason,
    pub index: &'a RetrievalIndex,
}

/// Guard verdict: caps, validity blocks, and the persisted check rows.
#[derive(Debug, Clone, Default)]
pub struct GuardOutcome {
    pub caps: ScoreCaps,
    pub validity_blocked_reasons: Vec<String>,
    pub checks: Vec<DeterministicCheck>,
}

impl GuardOutcome {
    /// Returns true when no check blocked validity.
    pub fn validity_ok(&self) -> bool {
        self.validity_blocked_reasons.is_empty()
    }
}

/// Lowercases and collapses whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fraction of expected signals present in `text` as normalized
/// substrings. Returns 1.0 when there are no signals to cover.
pub fn expected_signal_coverage(signals: &[String], text: &str) -> f64 {
    if signals.is_empty() {
        return 1.0;
    }
    let haystack = normalize(text);
    let matched = signals
        .iter()
        .filter(|signal| {
            let needle = normalize(signal);
            !needle.is_empty() && haystack.contains(&needle)
        })
        .count();
    matched as f64 / signals.len() as f64
}

/// Runs all five deterministic checks over an attempt.
pub fn run_guard_checks(input: &GuardInput<'_>) -> GuardOutcome {
    let mut outcome = GuardOutcome::default();

    // citation_presence: at least one citation
    let has_citations = !input.attempt.citations.is_empty();
    if !has_citations {
        ScoreCaps::cap(&mut outcome.caps.groundedness, 3.0);
        outcome
            .validity_blocked_reasons
            .push("missing_citations".to_string());
    }
    outcome.checks.push(DeterministicCheck {
        name: "citation_presence".to_string(),
        passed: has_citations,
        score_delta: if has_citations { 0.0 } else { -3.0 },
        details: Some(format!("{} citation(s)", input.attempt.citations.len())),
    });

    // citation_integrity: every citation resolves to an indexed chunk
    let mut invalid = Vec::new();
    for (i, citation) in input.attempt.citations.iter().enumerate() {
        let source_ok = !citation.source.is_empty() && citation.source != "unknown";
        let hash = citation.snippet_hash.as_deref().unwrap_or("");
        let fields_ok = source_ok && !hash.is_empty() && !citation.excerpt.is_empty();
        let indexed = fields_ok && input.index.contains(&citation.source, hash);
        if !indexed {
            invalid.push(i);
        }
    }
    let integrity_ok = invalid.is_empty();
    if !integrity_ok {
        ScoreCaps::cap(&mut outcome.caps.groundedness, 3.0);
        outcome
            .validity_blocked_reasons
            .push("invalid_citations".to_string());
    }
    outcome.checks.push(DeterministicCheck {
        name: "citation_integrity".to_string(),
        passed: integrity_ok,
        score_delta: if integrity_ok { 0.0 } else { -3.0 },
        details: if invalid.is_empty() {
            None
        } else {
            Some(format!("invalid citation indices: {:?}", invalid))
        },
    });

    // expected_signal_coverage over the answer and its steps
    let answer_text = format!("{}\n{}", input.attempt.answer, input.attempt.steps.join("\n"));
    let coverage = expected_signal_coverage(&input.task.expected_signals, &answer_text);
    let coverage_ok = coverage >= SIGNAL_COVERAGE_THRESHOLD;
    if !coverage_ok {
        ScoreCaps::cap(&mut outcome.caps.completeness, 6.0);
    }
    outcome.checks.push(DeterministicCheck {
        name: "expected_signal_coverage".to_string(),
        passed: coverage_ok,
        score_delta: if coverage_ok { 0.0 } else { -2.0 },
        details: Some(format!("coverage {:.2}", coverage)),
    });

    // actionable_step_depth: enough answer steps and enough iterations
    let depth_ok = input.attempt.steps.len() >= 2 && input.step_count >= 2;
    if !depth_ok {
        ScoreCaps::cap(&mut outcome.caps.actionability, 6.0);
    }
    outcome.checks.push(DeterministicCheck {
        name: "actionable_step_depth".to_string(),
        passed: depth_ok,
        score_delta: if depth_ok { 0.0 } else { -2.0 },
        details: Some(format!(
            "{} answer steps over {} iterations",
            input.attempt.steps.len(),
            input.step_count
        )),
    });

    // bounded_termination: the loop ended because the agent finished
    let terminated_ok = input.stop_reason == StopReason::Completed;
    if !terminated_ok {
        ScoreCaps::cap(&mut outcome.caps.correctness, 8.0);
    }
    outcome.checks.push(DeterministicCheck {
        name: "bounded_termination".to_string(),
        passed: terminated_ok,
        score_delta: if terminated_ok { 0.0 } else { -1.0 },
        details: Some(format!("stop reason: {}", input.stop_reason)),
    });

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Artifact, ArtifactType};
    use crate::types::Citation;

    fn index_with(content: &str) -> RetrievalIndex {
        RetrievalIndex::build(&[Artifact::new(
            ArtifactType::Page,
            "https://docs.example.com/auth",
            content,
        )])
    }

    fn task_with_signals(signals: &[&str]) -> Task {
        Task::new(
            "run-1",
            "Authenticate",
            "Authenticate against the API",
            "authentication",
            "medium",
            signals.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn valid_citation(index: &RetrievalIndex) -> Citation {
        let hit = &index.retrieve("api key authorization header", 1)[0];
        Citation {
            source: hit.source_url.clone(),
            snippet_hash: Some(hit.snippet_hash.clone()),
            excerpt: hit.text.clone(),
            start_offset: None,
            end_offset: None,
        }
    }

    fn passing_attempt(index: &RetrievalIndex) -> TaskAttempt {
        TaskAttempt {
            answer: "Send the api key in the Authorization header.".to_string(),
            steps: vec![
                "Create an api key in the dashboard".to_string(),
                "Set the Authorization header".to_string(),
            ],
            citations: vec![valid_citation(index)],
        }
    }

    #[test]
    fn test_all_checks_pass_on_good_attempt() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key", "authorization header"]);
        let attempt = passing_attempt(&index);
        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        assert!(outcome.checks.iter().all(|c| c.passed));
        assert!(outcome.validity_ok());
        assert_eq!(outcome.caps, ScoreCaps::default());
    }

    #[test]
    fn test_missing_citations_blocks_and_caps() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key"]);
        let mut attempt = passing_attempt(&index);
        attempt.citations.clear();

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        assert!(outcome
            .validity_blocked_reasons
            .contains(&"missing_citations".to_string()));
        assert_eq!(outcome.caps.groundedness, Some(3.0));
        let presence = outcome
            .checks
            .iter()
            .find(|c| c.name == "citation_presence")
            .unwrap();
        assert!(!presence.passed);
    }

    #[test]
    fn test_unknown_source_fails_integrity() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key"]);
        let mut attempt = passing_attempt(&index);
        attempt.citations[0].source = "unknown".to_string();

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        assert!(outcome
            .validity_blocked_reasons
            .contains(&"invalid_citations".to_string()));
        assert_eq!(outcome.caps.groundedness, Some(3.0));
    }

    #[test]
    fn test_unindexed_citation_fails_integrity() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key"]);
        let mut attempt = passing_attempt(&index);
        attempt.citations[0].snippet_hash = Some("deadbeefdeadbeef".to_string());

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        let integrity = outcome
            .checks
            .iter()
            .find(|c| c.name == "citation_integrity")
            .unwrap();
        assert!(!integrity.passed);
    }

    #[test]
    fn test_signal_coverage_threshold() {
        // 1 of 3 signals covered: 0.33 < 0.45
        assert!(
            expected_signal_coverage(
                &[
                    "api key".to_string(),
                    "webhook secret".to_string(),
                    "oauth token".to_string()
                ],
                "only the API   KEY appears here"
            ) < SIGNAL_COVERAGE_THRESHOLD
        );
        // Whitespace collapsing makes "api   key" match "api key"
        assert_eq!(
            expected_signal_coverage(&["api key".to_string()], "API\n  key required"),
            1.0
        );
        // No signals means full coverage
        assert_eq!(expected_signal_coverage(&[], "anything"), 1.0);
    }

    #[test]
    fn test_low_coverage_caps_completeness() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["webhook secret", "oauth scope", "rate limit"]);
        let attempt = passing_attempt(&index);

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        assert_eq!(outcome.caps.completeness, Some(6.0));
        // Coverage failure caps but does not block validity
        assert!(outcome.validity_ok());
    }

    #[test]
    fn test_shallow_attempt_caps_actionability() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key"]);
        let mut attempt = passing_attempt(&index);
        attempt.steps.truncate(1);

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 1,
            stop_reason: StopReason::Completed,
            index: &index,
        });

        assert_eq!(outcome.caps.actionability, Some(6.0));
    }

    #[test]
    fn test_unbounded_termination_caps_correctness() {
        let index = index_with("Use the api key in the Authorization header.");
        let task = task_with_signals(&["api key"]);
        let attempt = passing_attempt(&index);

        let outcome = run_guard_checks(&GuardInput {
            task: &task,
            attempt: &attempt,
            step_count: 2,
            stop_reason: StopReason::StepLimit,
            index: &index,
        });

        assert_eq!(outcome.caps.correctness, Some(8.0));
        let termination = outcome
            .checks
            .iter()
            .find(|c| c.name == "bounded_termination")
            .unwrap();
        assert!(!termination.passed);
    }

    #[test]
    fn test_caps_apply_takes_minimum() {
        let caps = ScoreCaps {
            groundedness: Some(3.0),
            ..Default::default()
        };
        let scores = caps.apply(CriterionScores {
            completeness: 9.0,
            correctness: 9.0,
            groundedness: 8.0,
            actionability: 9.0,
        });
        assert_eq!(scores.groundedness, 3.0);
        assert_eq!(scores.completeness, 9.0);
    }
}
