//! Per-resource circuit breaker (§4.7): CLOSED → OPEN after N consecutive
//! failures, OPEN → HALF_OPEN after `open_duration`, HALF_OPEN resolves to
//! CLOSED on a success or back to OPEN on a failure. Keyed by resource (a
//! model name or tool category) so one flaky model doesn't trip calls to
//! another. Grounded on the `CircuitBreaker` class re-exported from
//! `agent/reliability/__init__.py`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct ResourceBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl ResourceBreaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }
}

/// Tracks one breaker per resource key. `failure_threshold` and
/// `open_duration` are shared across all resources (per `CircuitBreakerConfig`).
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    resources: HashMap<String, ResourceBreaker>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self { failure_threshold, open_duration, resources: HashMap::new() }
    }

    fn entry(&mut self, resource: &str) -> &mut ResourceBreaker {
        self.resources.entry(resource.to_string()).or_insert_with(ResourceBreaker::new)
    }

    /// Whether a call against `resource` is currently allowed. An OPEN
    /// breaker whose `open_duration` has elapsed transitions to HALF_OPEN
    /// and allows exactly one trial call through.
    pub fn allow(&mut self, resource: &str) -> bool {
        let open_duration = self.open_duration;
        let breaker = self.entry(resource);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if breaker.opened_at.is_some_and(|t| t.elapsed() >= open_duration) {
                    breaker.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, resource: &str) {
        let breaker = self.entry(resource);
        breaker.consecutive_failures = 0;
        breaker.state = CircuitState::Closed;
        breaker.opened_at = None;
    }

    pub fn record_failure(&mut self, resource: &str) {
        let threshold = self.failure_threshold;
        let breaker = self.entry(resource);
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
            }
            CircuitState::Closed | CircuitState::Open => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn state(&self, resource: &str) -> CircuitState {
        self.resources.get(resource).map(|b| b.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(30));
        cb.record_failure("gpt");
        cb.record_failure("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Closed);
        assert!(cb.allow("gpt"));
    }

    #[test]
    fn opens_after_consecutive_failures_and_blocks() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(30));
        cb.record_failure("gpt");
        cb.record_failure("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Open);
        assert!(!cb.allow("gpt"));
    }

    #[test]
    fn half_open_after_open_duration_elapses() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow("gpt"));
        assert_eq!(cb.state("gpt"), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure("gpt");
        std::thread::sleep(Duration::from_millis(5));
        cb.allow("gpt");
        cb.record_success("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(1));
        cb.record_failure("gpt");
        std::thread::sleep(Duration::from_millis(5));
        cb.allow("gpt");
        cb.record_failure("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Open);
    }

    #[test]
    fn resources_are_independent() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(30));
        cb.record_failure("gpt");
        assert_eq!(cb.state("gpt"), CircuitState::Open);
        assert_eq!(cb.state("claude"), CircuitState::Closed);
        assert!(cb.allow("claude"));
    }
}
