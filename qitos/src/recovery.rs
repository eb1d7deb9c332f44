//! Recovery policy: bounded arbitration of classified runtime failures.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorCategory, RuntimeErrorInfo, StopReason};

/// What the policy decided for one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    pub continue_run: bool,
    pub stop_reason: Option<StopReason>,
    pub note: &'static str,
}

/// One recorded failure with the policy's verdict and a remediation hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDiagnostic {
    pub step_id: u64,
    pub phase: String,
    pub category: String,
    pub message: String,
    pub recoverable: bool,
    pub decision: String,
    pub recommendation: String,
}

/// Classifies failures into continue/stop and bounds total recoveries per
/// run. Diagnostics accumulate into the failure report embedded in the
/// manifest summary.
pub struct RecoveryPolicy {
    max_recoveries_per_run: u32,
    recoveries: u32,
    diagnostics: Vec<FailureDiagnostic>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RecoveryPolicy {
    pub fn new(max_recoveries_per_run: u32) -> Self {
        Self {
            max_recoveries_per_run,
            recoveries: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Clear per-run counters; called on every engine run entry.
    pub fn reset(&mut self) {
        self.recoveries = 0;
        self.diagnostics.clear();
    }

    pub fn recoveries_used(&self) -> u32 {
        self.recoveries
    }

    pub fn diagnostics(&self) -> &[FailureDiagnostic] {
        &self.diagnostics
    }

    pub fn handle(&mut self, info: &RuntimeErrorInfo) -> RecoveryDecision {
        let recommendation = recommendation_for(info.category);

        if self.recoveries >= self.max_recoveries_per_run {
            self.record(info, recommendation, "stop");
            return RecoveryDecision {
                continue_run: false,
                stop_reason: Some(StopReason::UnrecoverableError),
                note: "max_recovery_exhausted",
            };
        }

        if info.recoverable {
            self.recoveries += 1;
            self.record(info, recommendation, "continue");
            return RecoveryDecision {
                continue_run: true,
                stop_reason: None,
                note: "recoverable_continue",
            };
        }

        self.record(info, recommendation, "stop");
        RecoveryDecision {
            continue_run: false,
            stop_reason: Some(StopReason::UnrecoverableError),
            note: "unrecoverable_stop",
        }
    }

    fn record(&mut self, info: &RuntimeErrorInfo, recommendation: &str, decision: &str) {
        self.diagnostics.push(FailureDiagnostic {
            step_id: info.step_id,
            phase: info.phase.clone(),
            category: info.category.as_str().to_string(),
            message: info.message.clone(),
            recoverable: info.recoverable,
            decision: decision.to_string(),
            recommendation: recommendation.to_string(),
        });
    }

    /// Failure report for the manifest summary.
    pub fn failure_report(&self, stop_reason: Option<StopReason>) -> Value {
        json!({
            "failure_count": self.diagnostics.len(),
            "failures": self.diagnostics,
            "stop_reason": stop_reason.map(|reason| reason.as_str()),
        })
    }
}

fn recommendation_for(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::ToolError => "Check tool name, arguments, and environment permissions.",
        ErrorCategory::ParseError => "Adjust parser or output format constraints.",
        ErrorCategory::StateError => "Validate state transitions and required state fields.",
        ErrorCategory::ModelError => "Check model connectivity/timeout and retry strategy.",
        ErrorCategory::SystemError => "Inspect runtime configuration and uncaught exceptions.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, RuntimeError};

    /// **Scenario**: recoverable failures consume credits until the budget,
    /// then the policy stops the run.
    #[test]
    fn bounded_recoveries() {
        let mut policy = RecoveryPolicy::new(2);
        let info = classify(&RuntimeError::Parse("bad".into()), "decide", 0);

        assert!(policy.handle(&info).continue_run);
        assert!(policy.handle(&info).continue_run);
        let third = policy.handle(&info);
        assert!(!third.continue_run);
        assert_eq!(third.stop_reason, Some(StopReason::UnrecoverableError));
        assert_eq!(third.note, "max_recovery_exhausted");
        assert_eq!(policy.diagnostics().len(), 3);
    }

    /// **Scenario**: non-recoverable categories stop immediately.
    #[test]
    fn unrecoverable_stops() {
        let mut policy = RecoveryPolicy::default();
        let info = classify(&RuntimeError::State("corrupt".into()), "reduce", 1);
        let decision = policy.handle(&info);
        assert!(!decision.continue_run);
        assert_eq!(decision.note, "unrecoverable_stop");
        assert_eq!(policy.recoveries_used(), 0);
    }

    /// **Scenario**: the failure report carries counts, diagnostics and
    /// per-category recommendations.
    #[test]
    fn failure_report_shape() {
        let mut policy = RecoveryPolicy::default();
        let info = classify(&RuntimeError::Parse("gibberish".into()), "decide", 0);
        policy.handle(&info);

        let report = policy.failure_report(Some(StopReason::Final));
        assert_eq!(report["failure_count"], 1);
        assert_eq!(report["failures"][0]["category"], "parse_error");
        assert!(report["failures"][0]["recommendation"]
            .as_str()
            .unwrap()
            .contains("parser"));
        assert_eq!(report["stop_reason"], "final");
    }

    /// **Scenario**: reset restores the full recovery budget.
    #[test]
    fn reset_restores_budget() {
        let mut policy = RecoveryPolicy::new(1);
        let info = classify(&RuntimeError::Tool("flaky".into()), "act", 0);
        policy.handle(&info);
        policy.reset();
        assert_eq!(policy.recoveries_used(), 0);
        assert!(policy.handle(&info).continue_run);
    }
}
