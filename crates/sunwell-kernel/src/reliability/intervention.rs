//! Human-intervention detection (§4.7): watches the event stream for
//! patterns the outer loop should surface to a person rather than silently
//! retry — the same repeated failure recurring, the budget approaching
//! exhaustion, or a file changing outside of any task the kernel dispatched.
//! Grounded on `InterventionReason`/`InterventionSignal`/`InterventionDetector`
//! as re-exported from `agent/reliability/__init__.py`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::events::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionReason {
    RepeatedFailures,
    BudgetNearExhaustion,
    UnexpectedFileModification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionSignal {
    pub reason: InterventionReason,
    pub message: String,
}

/// Tracks enough state across an event stream to notice a recurring
/// failure reason. `repeat_threshold` is how many times the exact same
/// failure string must repeat consecutively before it's surfaced.
pub struct InterventionDetector {
    repeat_threshold: u32,
    last_failure_reason: Option<String>,
    consecutive_repeats: u32,
    expected_paths: BTreeSet<String>,
}

impl InterventionDetector {
    pub fn new(repeat_threshold: u32) -> Self {
        Self { repeat_threshold, last_failure_reason: None, consecutive_repeats: 0, expected_paths: BTreeSet::new() }
    }

    /// Registers a path the kernel itself is about to modify, so a later
    /// modification to that path isn't flagged as unexpected.
    pub fn expect_modification(&mut self, path: &str) {
        self.expected_paths.insert(path.to_string());
    }

    pub fn clear_expected(&mut self, path: &str) {
        self.expected_paths.remove(path);
    }

    /// Feeds one event through the detector, returning a signal if it
    /// should be surfaced to a human.
    pub fn observe(&mut self, event: &EventKind) -> Option<InterventionSignal> {
        match event {
            EventKind::TaskFailed { reason, .. } => {
                if self.last_failure_reason.as_deref() == Some(reason.as_str()) {
                    self.consecutive_repeats += 1;
                } else {
                    self.last_failure_reason = Some(reason.clone());
                    self.consecutive_repeats = 1;
                }
                if self.consecutive_repeats >= self.repeat_threshold {
                    self.consecutive_repeats = 0;
                    return Some(InterventionSignal {
                        reason: InterventionReason::RepeatedFailures,
                        message: format!("same failure recurred {} times: {reason}", self.repeat_threshold),
                    });
                }
                None
            }
            EventKind::BudgetWarning { used_fraction } => Some(InterventionSignal {
                reason: InterventionReason::BudgetNearExhaustion,
                message: format!("budget at {:.0}% of ceiling", used_fraction * 100.0),
            }),
            _ => None,
        }
    }

    /// Flags a file modification the kernel did not itself schedule.
    pub fn observe_file_modification(&mut self, path: &str) -> Option<InterventionSignal> {
        if self.expected_paths.contains(path) {
            None
        } else {
            Some(InterventionSignal {
                reason: InterventionReason::UnexpectedFileModification,
                message: format!("modification to {path} outside any dispatched task"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_failures_do_not_trigger() {
        let mut det = InterventionDetector::new(3);
        assert!(det.observe(&EventKind::TaskFailed { task_id: "t1".into(), reason: "a".into() }).is_none());
        assert!(det.observe(&EventKind::TaskFailed { task_id: "t2".into(), reason: "b".into() }).is_none());
    }

    #[test]
    fn repeated_identical_failure_triggers_at_threshold() {
        let mut det = InterventionDetector::new(2);
        assert!(det.observe(&EventKind::TaskFailed { task_id: "t1".into(), reason: "boom".into() }).is_none());
        let signal = det.observe(&EventKind::TaskFailed { task_id: "t2".into(), reason: "boom".into() });
        assert!(matches!(signal.unwrap().reason, InterventionReason::RepeatedFailures));
    }

    #[test]
    fn budget_warning_always_surfaces() {
        let mut det = InterventionDetector::new(3);
        let signal = det.observe(&EventKind::BudgetWarning { used_fraction: 0.85 });
        assert!(matches!(signal.unwrap().reason, InterventionReason::BudgetNearExhaustion));
    }

    #[test]
    fn expected_modification_is_not_flagged() {
        let mut det = InterventionDetector::new(3);
        det.expect_modification("src/lib.rs");
        assert!(det.observe_file_modification("src/lib.rs").is_none());
    }

    #[test]
    fn unexpected_modification_is_flagged() {
        let mut det = InterventionDetector::new(3);
        let signal = det.observe_file_modification("src/sneaky.rs");
        assert!(matches!(signal.unwrap().reason, InterventionReason::UnexpectedFileModification));
    }
}
