//! Per-phase totals aggregation.

use std::collections::BTreeMap;

use crate::types::{PhaseTotals, TaskEvaluation, TotalsDelta};

/// Folds a phase's evaluations into totals. Empty input yields all zeros.
pub fn aggregate(evaluations: &[TaskEvaluation]) -> PhaseTotals {
    let total_tasks = evaluations.len() as u32;
    if total_tasks == 0 {
        return PhaseTotals::default();
    }

    let passed_tasks = evaluations.iter().filter(|e| e.pass).count() as u32;
    let failed_tasks = total_tasks - passed_tasks;
    let quality_passed_tasks = evaluations.iter().filter(|e| e.quality_pass).count() as u32;
    let validity_passed_tasks = evaluations.iter().filter(|e| e.validity_pass).count() as u32;
    let average_score =
        evaluations.iter().map(|e| e.average_score).sum::<f64>() / total_tasks as f64;

    let mut failure_breakdown: BTreeMap<String, u32> = BTreeMap::new();
    for evaluation in evaluations {
        if let Some(class) = evaluation.failure_class {
            *failure_breakdown.entry(class.to_string()).or_insert(0) += 1;
        }
    }

    let rate = |count: u32| count as f64 / total_tasks as f64;
    PhaseTotals {
        total_tasks,
        passed_tasks,
        failed_tasks,
        pass_rate: rate(passed_tasks),
        quality_passed_tasks,
        quality_pass_rate: rate(quality_passed_tasks),
        validity_passed_tasks,
        validity_pass_rate: rate(validity_passed_tasks),
        average_score,
        failure_breakdown,
    }
}

/// Component-wise `optimized − baseline`, rounded to 4 decimals.
pub fn compute_delta(baseline: &PhaseTotals, optimized: &PhaseTotals) -> TotalsDelta {
    TotalsDelta {
        pass_rate_delta: round4(optimized.pass_rate - baseline.pass_rate),
        average_score_delta: round4(optimized.average_score - baseline.average_score),
        passed_tasks_delta: optimized.passed_tasks as i64 - baseline.passed_tasks as i64,
        failed_tasks_delta: optimized.failed_tasks as i64 - baseline.failed_tasks as i64,
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CriterionScores, FailureClass, RunPhase};

    fn evaluation(pass: bool, quality: bool, validity: bool, score: f64) -> TaskEvaluation {
        TaskEvaluation {
            run_id: "run-1".to_string(),
            task_id: "task".to_string(),
            phase: RunPhase::Baseline,
            criterion_scores: CriterionScores::default(),
            average_score: score,
            pass,
            quality_pass: quality,
            validity_pass: validity,
            validity_blocked_reasons: Vec::new(),
            failure_class: if pass {
                None
            } else {
                Some(FailureClass::MissingContent)
            },
            rationale: String::new(),
            judge_model: "judge".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_empty_input_yields_zeros() {
        let totals = aggregate(&[]);
        assert_eq!(totals, PhaseTotals::default());
        assert_eq!(totals.total_tasks, 0);
        assert_eq!(totals.pass_rate, 0.0);
    }

    #[test]
    fn test_counts_and_rates() {
        let evaluations = vec![
            evaluation(true, true, true, 8.0),
            evaluation(false, true, false, 7.5),
            evaluation(false, false, true, 4.0),
        ];
        let totals = aggregate(&evaluations);

        assert_eq!(totals.total_tasks, 3);
        assert_eq!(totals.passed_tasks, 1);
        assert_eq!(totals.failed_tasks, 2);
        assert!((totals.pass_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(totals.quality_passed_tasks, 2);
        assert_eq!(totals.validity_passed_tasks, 2);
        assert!((totals.average_score - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_failure_breakdown_excludes_passes() {
        let evaluations = vec![
            evaluation(true, true, true, 9.0),
            evaluation(false, false, false, 3.0),
            evaluation(false, false, false, 2.0),
        ];
        let totals = aggregate(&evaluations);
        assert_eq!(totals.failure_breakdown.len(), 1);
        assert_eq!(totals.failure_breakdown["missing_content"], 2);
    }

    #[test]
    fn test_aggregate_is_idempotent_over_append_empty() {
        let evaluations = vec![
            evaluation(true, true, true, 8.0),
            evaluation(false, false, false, 3.0),
        ];
        let once = aggregate(&evaluations);
        let again = aggregate(&evaluations);
        assert_eq!(once, again);
        assert_eq!(
            once.passed_tasks as usize,
            evaluations.iter().filter(|e| e.pass).count()
        );
    }

    #[test]
    fn test_delta_rounding() {
        let baseline = aggregate(&[
            evaluation(true, true, true, 6.0),
            evaluation(false, false, false, 3.0),
            evaluation(false, false, false, 3.0),
        ]);
        let optimized = aggregate(&[
            evaluation(true, true, true, 8.0),
            evaluation(true, true, true, 8.0),
            evaluation(true, true, true, 8.0),
        ]);
        let delta = compute_delta(&baseline, &optimized);
        assert_eq!(delta.passed_tasks_delta, 2);
        assert_eq!(delta.failed_tasks_delta, -2);
        assert!((delta.pass_rate_delta - 0.6667).abs() < 1e-9);
        assert_eq!(delta.average_score_delta, 4.0);
    }
}
