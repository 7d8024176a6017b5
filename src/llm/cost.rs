//! Cost pricing for model calls.
//!
//! Pricing sits behind the `CostModel` trait so provider-reported cost or
//! per-model rate tables can replace the flat placeholder without touching
//! the agent loop or the budget accountant.

use super::Usage;

/// Prices the token usage of one model call in USD.
pub trait CostModel: Send + Sync {
    /// Returns the cost estimate for a call's usage.
    fn call_cost_usd(&self, usage: &Usage) -> f64;
}

/// Flat per-million-token pricing.
#[derive(Debug, Clone, Copy)]
pub struct FlatRateCost {
    /// USD per one million input tokens.
    pub input_usd_per_million: f64,
    /// USD per one million output tokens.
    pub output_usd_per_million: f64,
}

impl Default for FlatRateCost {
    fn default() -> Self {
        Self {
            input_usd_per_million: 0.5,
            output_usd_per_million: 2.0,
        }
    }
}

impl CostModel for FlatRateCost {
    fn call_cost_usd(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 / 1_000_000.0 * self.input_usd_per_million
            + usage.output_tokens as f64 / 1_000_000.0 * self.output_usd_per_million
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_rate_default() {
        let pricing = FlatRateCost::default();
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
        };
        // 1M in at $0.5 + 0.5M out at $2.0 = $1.50
        assert!((pricing.call_cost_usd(&usage) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_zero_usage_is_free() {
        let pricing = FlatRateCost::default();
        assert_eq!(pricing.call_cost_usd(&Usage::default()), 0.0);
    }

    #[test]
    fn test_small_calls_are_fractional() {
        let pricing = FlatRateCost::default();
        let usage = Usage {
            input_tokens: 1_000,
            output_tokens: 250,
        };
        let cost = pricing.call_cost_usd(&usage);
        assert!(cost > 0.0);
        assert!(cost < 0.01);
    }
}
