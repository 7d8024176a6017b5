//! Budget accounting for task executions.
//!
//! Each execution tracks steps, tokens, and cost against the caps in the
//! run configuration. Termination checks are ordered: after each model
//! call, token exhaustion is checked before cancellation, which is checked
//! before the run-level cost cap; the step limit is checked at the top of
//! each iteration.

use crate::types::{RemainingBudget, StopReason};

/// The caps one task execution runs under.
#[derive(Debug, Clone, Copy)]
pub struct TaskBudget {
    pub max_steps: u32,
    pub max_tokens: u64,
    pub hard_cost_cap_usd: f64,
}

/// Tracks one execution's consumption against its budget.
#[derive(Debug, Clone)]
pub struct BudgetAccountant {
    budget: TaskBudget,
    steps_used: u32,
    tokens_used: u64,
    cost_used: f64,
}

impl BudgetAccountant {
    /// Creates an accountant with nothing consumed.
    pub fn new(budget: TaskBudget) -> Self {
        Self {
            budget,
            steps_used: 0,
            tokens_used: 0,
            cost_used: 0.0,
        }
    }

    /// Records one completed iteration.
    pub fn record_step(&mut self) {
        self.steps_used += 1;
    }

    /// Records the usage and cost of one model call.
    pub fn apply(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens_used += tokens;
        self.cost_used += cost_usd;
    }

    /// Steps consumed so far.
    pub fn steps_used(&self) -> u32 {
        self.steps_used
    }

    /// Tokens consumed so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    /// Cost consumed by this execution so far, in USD.
    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    /// Checks run at the top of each iteration: the step limit.
    pub fn check_iteration_start(&self) -> Option<StopReason> {
        if self.steps_used >= self.budget.max_steps {
            Some(StopReason::StepLimit)
        } else {
            None
        }
    }

    /// Checks run after each model call, in precedence order:
    /// token exhaustion, then cancellation, then the run-level cost cap.
    ///
    /// `run_cost_estimate` is the run's current total (across all
    /// executions), read back after the atomic increment.
    pub fn check_after_call(
        &self,
        run_canceled: bool,
        run_cost_estimate: f64,
    ) -> Option<StopReason> {
        if self.tokens_used >= self.budget.max_tokens {
            return Some(StopReason::TokenLimit);
        }
        if run_canceled {
            return Some(StopReason::Cancelled);
        }
        if run_cost_estimate >= self.budget.hard_cost_cap_usd {
            return Some(StopReason::CostLimit);
        }
        None
    }

    /// Budget still available, written back into agent memory.
    pub fn remaining(&self) -> RemainingBudget {
        RemainingBudget {
            steps: self.budget.max_steps.saturating_sub(self.steps_used),
            tokens: self.budget.max_tokens.saturating_sub(self.tokens_used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant() -> BudgetAccountant {
        BudgetAccountant::new(TaskBudget {
            max_steps: 3,
            max_tokens: 1_000,
            hard_cost_cap_usd: 0.50,
        })
    }

    #[test]
    fn test_step_limit_at_iteration_start() {
        let mut acct = accountant();
        assert_eq!(acct.check_iteration_start(), None);
        acct.record_step();
        acct.record_step();
        assert_eq!(acct.check_iteration_start(), None);
        acct.record_step();
        assert_eq!(acct.check_iteration_start(), Some(StopReason::StepLimit));
    }

    #[test]
    fn test_token_limit_has_highest_precedence() {
        let mut acct = accountant();
        acct.apply(1_000, 0.0);
        // Token limit wins even when the run is canceled and over cost
        assert_eq!(
            acct.check_after_call(true, 10.0),
            Some(StopReason::TokenLimit)
        );
    }

    #[test]
    fn test_cancellation_before_cost_cap() {
        let acct = accountant();
        assert_eq!(acct.check_after_call(true, 10.0), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_cost_cap_uses_run_total() {
        let acct = accountant();
        // This execution spent nothing, but the run as a whole is capped
        assert_eq!(acct.check_after_call(false, 0.50), Some(StopReason::CostLimit));
        assert_eq!(acct.check_after_call(false, 0.49), None);
    }

    #[test]
    fn test_remaining_budget_saturates() {
        let mut acct = accountant();
        acct.record_step();
        acct.apply(400, 0.01);
        let remaining = acct.remaining();
        assert_eq!(remaining.steps, 2);
        assert_eq!(remaining.tokens, 600);

        acct.apply(2_000, 0.0);
        assert_eq!(acct.remaining().tokens, 0);
    }

    #[test]
    fn test_apply_accumulates() {
        let mut acct = accountant();
        acct.apply(100, 0.001);
        acct.apply(250, 0.002);
        assert_eq!(acct.tokens_used(), 350);
        assert!((acct.cost_used() - 0.003).abs() < 1e-12);
    }
}
