//! Session budget tracking (§4.7): a hard token/dollar ceiling plus a
//! warning threshold, checked at every call boundary *before* the circuit
//! breaker is consulted (Open Question 2's resolution — see
//! `ReliabilityContext::allow_call` in `reliability::mod`). Grounded on the
//! `SessionCostTracker`/`ModelCost` pairing re-exported from
//! `agent/reliability/__init__.py`, simplified to the two totals the kernel
//! actually enforces (the original's per-model cost table is a host/pricing
//! concern, not a kernel one).

use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Allowed,
    Warning,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetTracker {
    config: BudgetConfig,
    spent_tokens: u64,
    spent_dollars: f64,
    warned: bool,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config, spent_tokens: 0, spent_dollars: 0.0, warned: false }
    }

    pub fn spent_tokens(&self) -> u64 {
        self.spent_tokens
    }

    pub fn spent_dollars(&self) -> f64 {
        self.spent_dollars
    }

    fn exhausted(&self) -> bool {
        self.spent_tokens >= self.config.max_tokens || self.spent_dollars >= self.config.max_dollars
    }

    fn over_warning(&self) -> bool {
        let token_fraction = self.spent_tokens as f64 / self.config.max_tokens.max(1) as f64;
        let dollar_fraction = self.spent_dollars / self.config.max_dollars.max(f64::MIN_POSITIVE);
        token_fraction.max(dollar_fraction) >= self.config.warning_threshold
    }

    /// Whether a call is currently allowed under the budget. This is the
    /// check the coordinator must run *first*, ahead of the circuit breaker.
    pub fn check(&self) -> BudgetCheck {
        if self.exhausted() {
            BudgetCheck::Exhausted
        } else if self.over_warning() {
            BudgetCheck::Warning
        } else {
            BudgetCheck::Allowed
        }
    }

    /// Records actual spend after a call completes. Returns `true` the
    /// first time this crosses the warning threshold (so the caller emits
    /// exactly one `BudgetWarning` event rather than one per subsequent call).
    pub fn record_usage(&mut self, tokens: u64, dollars: f64) -> bool {
        self.spent_tokens += tokens;
        self.spent_dollars += dollars;
        if !self.warned && self.over_warning() {
            self.warned = true;
            true
        } else {
            false
        }
    }

    pub fn used_fraction(&self) -> f64 {
        let token_fraction = self.spent_tokens as f64 / self.config.max_tokens.max(1) as f64;
        let dollar_fraction = self.spent_dollars / self.config.max_dollars.max(f64::MIN_POSITIVE);
        token_fraction.max(dollar_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BudgetConfig {
        BudgetConfig { max_tokens: 1000, max_dollars: 10.0, warning_threshold: 0.8 }
    }

    #[test]
    fn allows_calls_under_threshold() {
        let tracker = BudgetTracker::new(config());
        assert_eq!(tracker.check(), BudgetCheck::Allowed);
    }

    #[test]
    fn warns_once_past_threshold() {
        let mut tracker = BudgetTracker::new(config());
        assert!(!tracker.record_usage(500, 0.0));
        assert!(tracker.record_usage(400, 0.0));
        assert_eq!(tracker.check(), BudgetCheck::Warning);
        assert!(!tracker.record_usage(10, 0.0));
    }

    #[test]
    fn exhausts_at_token_ceiling() {
        let mut tracker = BudgetTracker::new(config());
        tracker.record_usage(1000, 0.0);
        assert_eq!(tracker.check(), BudgetCheck::Exhausted);
    }

    #[test]
    fn exhausts_at_dollar_ceiling_independent_of_tokens() {
        let mut tracker = BudgetTracker::new(config());
        tracker.record_usage(0, 10.0);
        assert_eq!(tracker.check(), BudgetCheck::Exhausted);
    }
}
