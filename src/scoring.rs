//! Scoring policy
//!
//! Maps a runner summary onto a terminal status, a score and an XP grant.
//! The orchestration layer only calls through [`ScoringPolicy`]; partial-credit
//! thresholds and XP rules belong to the policy.

use crate::protocol::RunSummary;
use crate::reducer::EvaluationStatus;

pub trait ScoringPolicy: Send + Sync {
    /// Terminal status for a completed run (PASSED, FAILED or PARTIAL).
    /// The reducer treats any other status as FAILED.
    fn classify(&self, summary: &RunSummary) -> EvaluationStatus;

    /// Score in 0..=100
    fn score(&self, summary: &RunSummary) -> u32;

    /// XP granted for a completed run. Never called for ERROR or CANCELLED.
    fn xp(&self, status: EvaluationStatus, summary: &RunSummary, reward: u32) -> u32;
}

/// Default policy: full pass, proportional credit above a pass-ratio threshold,
/// nothing otherwise
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    partial_percent: u32,
}

impl ThresholdPolicy {
    pub fn new(partial_percent: u32) -> Self {
        Self {
            partial_percent: partial_percent.min(100),
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(50)
    }
}

impl ScoringPolicy for ThresholdPolicy {
    fn classify(&self, summary: &RunSummary) -> EvaluationStatus {
        let passed = summary.passed_tests.min(summary.total_tests);
        if summary.total_tests == 0 {
            return EvaluationStatus::Failed;
        }
        if summary.success && passed == summary.total_tests {
            return EvaluationStatus::Passed;
        }
        // u64 so large test counts cannot overflow the comparison
        if passed > 0
            && (passed as u64) * 100 >= (self.partial_percent as u64) * (summary.total_tests as u64)
        {
            EvaluationStatus::Partial
        } else {
            EvaluationStatus::Failed
        }
    }

    fn score(&self, summary: &RunSummary) -> u32 {
        if summary.total_tests == 0 {
            return 0;
        }
        let passed = summary.passed_tests.min(summary.total_tests) as u64;
        (passed * 100 / summary.total_tests as u64) as u32
    }

    fn xp(&self, status: EvaluationStatus, summary: &RunSummary, reward: u32) -> u32 {
        match status {
            EvaluationStatus::Passed => reward,
            EvaluationStatus::Partial if summary.total_tests > 0 => {
                let passed = summary.passed_tests.min(summary.total_tests) as u64;
                (reward as u64 * passed / summary.total_tests as u64) as u32
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(success: bool, passed: u32, total: u32) -> RunSummary {
        RunSummary {
            success,
            passed_tests: passed,
            total_tests: total,
            execution_time_ms: None,
        }
    }

    #[test]
    fn test_all_passed_is_passed_with_full_reward() {
        let policy = ThresholdPolicy::default();
        let s = summary(true, 3, 3);
        assert_eq!(policy.classify(&s), EvaluationStatus::Passed);
        assert_eq!(policy.score(&s), 100);
        assert_eq!(policy.xp(EvaluationStatus::Passed, &s, 150), 150);
    }

    #[test]
    fn test_half_passed_is_partial_at_default_threshold() {
        let policy = ThresholdPolicy::default();
        let s = summary(false, 1, 2);
        assert_eq!(policy.classify(&s), EvaluationStatus::Partial);
        assert_eq!(policy.score(&s), 50);
        assert_eq!(policy.xp(EvaluationStatus::Partial, &s, 100), 50);
    }

    #[test]
    fn test_below_threshold_is_failed_without_xp() {
        let policy = ThresholdPolicy::new(75);
        let s = summary(false, 1, 2);
        assert_eq!(policy.classify(&s), EvaluationStatus::Failed);
        assert_eq!(policy.xp(EvaluationStatus::Failed, &s, 100), 0);
    }

    #[test]
    fn test_no_tests_is_failed() {
        let policy = ThresholdPolicy::default();
        let s = summary(true, 0, 0);
        assert_eq!(policy.classify(&s), EvaluationStatus::Failed);
        assert_eq!(policy.score(&s), 0);
    }

    #[test]
    fn test_runner_overcount_is_clamped() {
        let policy = ThresholdPolicy::default();
        let s = summary(false, 5, 2);
        assert_eq!(policy.score(&s), 100);
        assert_eq!(policy.classify(&s), EvaluationStatus::Partial);
        assert_eq!(policy.xp(EvaluationStatus::Partial, &s, 80), 80);
    }
}
