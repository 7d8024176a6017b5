//! LLM rubric judge.
//!
//! Two schema-validated calls per attempt: an alignment pass that checks
//! the answer against retrieved evidence, then a rubric pass that scores
//! four criteria. Guardrails and deterministic caps post-process the
//! scores; a borderline average triggers an optional tie-break re-score.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::{ModelClient, ModelConfig, Usage};
use crate::prompts;
use crate::retrieval::ScoredChunk;
use crate::types::{
    CriterionScores, FailureClass, RunPhase, Task, TaskAttempt, TaskEvaluation,
};

use super::guard::GuardOutcome;

/// Rubric average required for a quality pass.
pub const QUALITY_PASS_THRESHOLD: f64 = 7.0;

/// Tie-break band: a second rubric call runs when the average lands here.
pub const TIE_BREAK_BAND: (f64, f64) = (6.5, 7.5);

/// Alignment verdict returned by the first judge call.
#[derive(Debug, Clone, Deserialize)]
pub struct AlignmentResult {
    pub is_supported_by_evidence: bool,
    pub unsupported_claims: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RubricResponse {
    scores: RubricScores,
    rationale: String,
    confidence: f64,
    #[serde(default)]
    suggested_failure_class: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RubricScores {
    completeness: f64,
    correctness: f64,
    groundedness: f64,
    actionability: f64,
}

impl From<RubricScores> for CriterionScores {
    fn from(scores: RubricScores) -> Self {
        CriterionScores {
            completeness: scores.completeness,
            correctness: scores.correctness,
            groundedness: scores.groundedness,
            actionability: scores.actionability,
        }
    }
}

/// A finished evaluation plus the judge's token usage, which the caller
/// folds into the execution's budget so run cost stays the sum of
/// execution costs.
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub evaluation: TaskEvaluation,
    pub usage: Usage,
}

/// Two-pass rubric judge over one task attempt.
pub struct RubricJudge {
    client: Arc<dyn ModelClient>,
    config: ModelConfig,
    tie_break_enabled: bool,
}

impl RubricJudge {
    /// Creates a judge using the given model configuration.
    pub fn new(client: Arc<dyn ModelClient>, config: ModelConfig, tie_break_enabled: bool) -> Self {
        Self {
            client,
            config,
            tie_break_enabled,
        }
    }

    /// Evaluates one attempt against the task and the guard verdict.
    pub async fn evaluate(
        &self,
        run_id: &str,
        task: &Task,
        phase: RunPhase,
        attempt: &TaskAttempt,
        guard: &GuardOutcome,
        evidence: &[ScoredChunk],
    ) -> Result<JudgeOutcome, LlmError> {
        let mut usage = Usage::default();

        // Alignment pass
        let alignment_messages = prompts::build_alignment_messages(task, attempt, evidence);
        let completion = self
            .client
            .complete_json(&self.config, &alignment_messages, &prompts::alignment_schema())
            .await?;
        usage.input_tokens += completion.usage.input_tokens;
        usage.output_tokens += completion.usage.output_tokens;
        let alignment: AlignmentResult = serde_json::from_value(completion.parsed)
            .map_err(|e| LlmError::ParseError(format!("alignment response: {}", e)))?;

        // Rubric pass
        let (first, judge_model) = self.rubric_call(task, attempt, &alignment, &mut usage).await?;
        let mut scores = post_process(first.scores.into(), attempt, &alignment, guard);
        let mut average = scores.average();

        if self.tie_break_enabled && average >= TIE_BREAK_BAND.0 && average <= TIE_BREAK_BAND.1 {
            debug!(
                task_id = %task.task_id,
                average = average,
                "Borderline rubric average, running tie-break"
            );
            let (second, _) = self.rubric_call(task, attempt, &alignment, &mut usage).await?;
            let second_scores = post_process(second.scores.into(), attempt, &alignment, guard);
            scores = CriterionScores {
                completeness: round2((scores.completeness + second_scores.completeness) / 2.0),
                correctness: round2((scores.correctness + second_scores.correctness) / 2.0),
                groundedness: round2((scores.groundedness + second_scores.groundedness) / 2.0),
                actionability: round2((scores.actionability + second_scores.actionability) / 2.0),
            };
            average = scores.average();
        }
        let average = round2(average);

        let quality_pass = average >= QUALITY_PASS_THRESHOLD;
        let validity_pass = alignment.is_supported_by_evidence && guard.validity_ok();
        let pass = quality_pass && validity_pass;

        let failure_class = if pass {
            None
        } else {
            Some(classify_failure(
                first.suggested_failure_class.as_deref(),
                &first.rationale,
                &scores,
            ))
        };

        let evaluation = TaskEvaluation {
            run_id: run_id.to_string(),
            task_id: task.task_id.clone(),
            phase,
            criterion_scores: scores,
            average_score: average,
            pass,
            quality_pass,
            validity_pass,
            validity_blocked_reasons: guard.validity_blocked_reasons.clone(),
            failure_class,
            rationale: first.rationale,
            judge_model,
            confidence: first.confidence,
        };

        Ok(JudgeOutcome { evaluation, usage })
    }

    async fn rubric_call(
        &self,
        task: &Task,
        attempt: &TaskAttempt,
        alignment: &AlignmentResult,
        usage: &mut Usage,
    ) -> Result<(RubricResponse, String), LlmError> {
        let messages = prompts::build_rubric_messages(
            task,
            attempt,
            alignment.is_supported_by_evidence,
            &alignment.unsupported_claims,
        );
        let completion = self
            .client
            .complete_json(&self.config, &messages, &prompts::rubric_schema())
            .await?;
        usage.input_tokens += completion.usage.input_tokens;
        usage.output_tokens += completion.usage.output_tokens;
        let response: RubricResponse = serde_json::from_value(completion.parsed)
            .map_err(|e| LlmError::ParseError(format!("rubric response: {}", e)))?;
        Ok((response, completion.model))
    }
}

/// Applies guardrails, then deterministic caps, then clamps to [0, 10].
fn post_process(
    mut scores: CriterionScores,
    attempt: &TaskAttempt,
    alignment: &AlignmentResult,
    guard: &GuardOutcome,
) -> CriterionScores {
    if attempt.citations.is_empty() {
        scores.groundedness = scores.groundedness.min(4.0);
    }
    if attempt.steps.len() < 2 {
        scores.actionability = scores.actionability.min(6.0);
    }
    if !alignment.unsupported_claims.is_empty() {
        scores.correctness = scores.correctness.min(6.0);
        scores.groundedness = scores.groundedness.min(5.0);
    }
    guard.caps.apply(scores).clamped()
}

/// Rounds to 2 decimals, half away from zero.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Classifies a failing evaluation.
///
/// Precedence: the judge's suggestion when it is in the allowed set, then
/// rationale keywords, then score-based heuristics.
pub fn classify_failure(
    suggested: Option<&str>,
    rationale: &str,
    scores: &CriterionScores,
) -> FailureClass {
    if let Some(class) = suggested.and_then(FailureClass::parse) {
        return class;
    }

    let rationale = rationale.to_lowercase();
    if rationale.contains("outdated") || rationale.contains("deprecated") {
        return FailureClass::OutdatedContent;
    }
    if rationale.contains("broken link") || rationale.contains("404") {
        return FailureClass::BrokenLinks;
    }
    if rationale.contains("no example") || rationale.contains("missing example") {
        return FailureClass::MissingExamples;
    }
    if rationale.contains("ambiguous") || rationale.contains("unclear") {
        return FailureClass::AmbiguousInstructions;
    }

    if scores.groundedness < 5.0 {
        return FailureClass::MissingContent;
    }
    if scores.actionability < 6.0 && scores.completeness < 6.0 {
        return FailureClass::InsufficientDetail;
    }
    FailureClass::PoorStructure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::guard::ScoreCaps;
    use crate::types::Citation;

    fn scores(c: f64, co: f64, g: f64, a: f64) -> CriterionScores {
        CriterionScores {
            completeness: c,
            correctness: co,
            groundedness: g,
            actionability: a,
        }
    }

    fn supported_alignment() -> AlignmentResult {
        AlignmentResult {
            is_supported_by_evidence: true,
            unsupported_claims: Vec::new(),
            notes: String::new(),
        }
    }

    fn grounded_attempt() -> TaskAttempt {
        TaskAttempt {
            answer: "answer".to_string(),
            steps: vec!["step one".to_string(), "step two".to_string()],
            citations: vec![Citation {
                source: "https://docs.example.com/auth".to_string(),
                snippet_hash: Some("abcd".to_string()),
                excerpt: "excerpt".to_string(),
                start_offset: None,
                end_offset: None,
            }],
        }
    }

    #[test]
    fn test_round2_half_away_from_zero() {
        // 7.125 and 7.375 are exactly representable, so the midpoint
        // behavior is observable: both round away from zero.
        assert_eq!(round2(7.125), 7.13);
        assert_eq!(round2(7.375), 7.38);
        assert_eq!(round2(7.124), 7.12);
        assert_eq!(round2(8.0 / 3.0), 2.67);
    }

    #[test]
    fn test_guardrail_zero_citations() {
        let mut attempt = grounded_attempt();
        attempt.citations.clear();
        let result = post_process(
            scores(9.0, 9.0, 9.0, 9.0),
            &attempt,
            &supported_alignment(),
            &GuardOutcome::default(),
        );
        assert_eq!(result.groundedness, 4.0);
    }

    #[test]
    fn test_guardrail_few_steps() {
        let mut attempt = grounded_attempt();
        attempt.steps.truncate(1);
        let result = post_process(
            scores(9.0, 9.0, 9.0, 9.0),
            &attempt,
            &supported_alignment(),
            &GuardOutcome::default(),
        );
        assert_eq!(result.actionability, 6.0);
    }

    #[test]
    fn test_guardrail_unsupported_claims() {
        let alignment = AlignmentResult {
            is_supported_by_evidence: false,
            unsupported_claims: vec!["invented endpoint".to_string()],
            notes: String::new(),
        };
        let result = post_process(
            scores(9.0, 9.0, 9.0, 9.0),
            &grounded_attempt(),
            &alignment,
            &GuardOutcome::default(),
        );
        assert_eq!(result.correctness, 6.0);
        assert_eq!(result.groundedness, 5.0);
    }

    #[test]
    fn test_deterministic_caps_apply_after_guardrails() {
        let guard = GuardOutcome {
            caps: ScoreCaps {
                groundedness: Some(3.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = post_process(
            scores(9.0, 9.0, 9.0, 9.0),
            &grounded_attempt(),
            &supported_alignment(),
            &guard,
        );
        assert_eq!(result.groundedness, 3.0);
    }

    #[test]
    fn test_classify_uses_valid_suggestion() {
        let class = classify_failure(
            Some("missing_examples"),
            "whatever",
            &scores(9.0, 9.0, 9.0, 9.0),
        );
        assert_eq!(class, FailureClass::MissingExamples);
    }

    #[test]
    fn test_classify_ignores_unknown_suggestion() {
        let class = classify_failure(
            Some("not_a_real_class"),
            "the docs reference a deprecated endpoint",
            &scores(9.0, 9.0, 9.0, 9.0),
        );
        assert_eq!(class, FailureClass::OutdatedContent);
    }

    #[test]
    fn test_classify_rationale_keywords() {
        let high = scores(9.0, 9.0, 9.0, 9.0);
        assert_eq!(
            classify_failure(None, "the install link is a 404", &high),
            FailureClass::BrokenLinks
        );
        assert_eq!(
            classify_failure(None, "there is no example of the webhook payload", &high),
            FailureClass::MissingExamples
        );
        assert_eq!(
            classify_failure(None, "instructions are ambiguous about auth", &high),
            FailureClass::AmbiguousInstructions
        );
    }

    #[test]
    fn test_classify_score_fallbacks() {
        assert_eq!(
            classify_failure(None, "plain", &scores(8.0, 8.0, 4.0, 8.0)),
            FailureClass::MissingContent
        );
        assert_eq!(
            classify_failure(None, "plain", &scores(5.0, 8.0, 8.0, 5.0)),
            FailureClass::InsufficientDetail
        );
        assert_eq!(
            classify_failure(None, "plain", &scores(8.0, 8.0, 8.0, 8.0)),
            FailureClass::PoorStructure
        );
    }
}
