//! Unified error taxonomy for the QitOS runtime.
//!
//! Every failure that crosses an engine phase boundary is classified into an
//! [`ErrorCategory`] with a recoverability flag; the recovery policy consumes
//! the resulting [`RuntimeErrorInfo`] to decide continue vs stop. Runs always
//! terminate with a [`StopReason`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Failure classification used by the recovery policy and trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ModelError,
    ParseError,
    ToolError,
    StateError,
    SystemError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::ParseError => "parse_error",
            ErrorCategory::ToolError => "tool_error",
            ErrorCategory::StateError => "state_error",
            ErrorCategory::SystemError => "system_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run terminated. Written to state and the manifest summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Success,
    Final,
    MaxSteps,
    BudgetSteps,
    BudgetTime,
    BudgetTokens,
    AgentCondition,
    EnvTerminal,
    CriticStop,
    TaskValidationFailed,
    Stagnation,
    UnrecoverableError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Success => "success",
            StopReason::Final => "final",
            StopReason::MaxSteps => "max_steps",
            StopReason::BudgetSteps => "budget_steps",
            StopReason::BudgetTime => "budget_time",
            StopReason::BudgetTokens => "budget_tokens",
            StopReason::AgentCondition => "agent_condition",
            StopReason::EnvTerminal => "env_terminal",
            StopReason::CriticStop => "critic_stop",
            StopReason::TaskValidationFailed => "task_validation_failed",
            StopReason::Stagnation => "stagnation",
            StopReason::UnrecoverableError => "unrecoverable_error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StopReason::Success),
            "final" => Ok(StopReason::Final),
            "max_steps" => Ok(StopReason::MaxSteps),
            "budget_steps" => Ok(StopReason::BudgetSteps),
            "budget_time" => Ok(StopReason::BudgetTime),
            "budget_tokens" => Ok(StopReason::BudgetTokens),
            "agent_condition" => Ok(StopReason::AgentCondition),
            "env_terminal" => Ok(StopReason::EnvTerminal),
            "critic_stop" => Ok(StopReason::CriticStop),
            "task_validation_failed" => Ok(StopReason::TaskValidationFailed),
            "stagnation" => Ok(StopReason::Stagnation),
            "unrecoverable_error" => Ok(StopReason::UnrecoverableError),
            other => Err(format!("invalid stop_reason: {other}")),
        }
    }
}

/// Error raised by a phase of the runtime. The variant is the category.
///
/// Layer-specific errors (`ParseError`, `ToolError`, `ModelError`, …) convert
/// into this type at the engine boundary so the recovery policy sees one
/// taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("model error: {0}")]
    Model(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("state error: {0}")]
    State(String),
    #[error("system error: {0}")]
    System(String),
}

impl RuntimeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::Model(_) => ErrorCategory::ModelError,
            RuntimeError::Parse(_) => ErrorCategory::ParseError,
            RuntimeError::Tool(_) => ErrorCategory::ToolError,
            RuntimeError::State(_) => ErrorCategory::StateError,
            RuntimeError::System(_) => ErrorCategory::SystemError,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RuntimeError::Model(m)
            | RuntimeError::Parse(m)
            | RuntimeError::Tool(m)
            | RuntimeError::State(m)
            | RuntimeError::System(m) => m,
        }
    }
}

/// A classified failure with enough context for diagnostics and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
    pub phase: String,
    pub step_id: u64,
    pub recoverable: bool,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Classify a runtime error raised in `phase` at `step_id`.
///
/// Recoverable set: model, parse, and tool errors. Any error raised while the
/// ACT phase owns the step is a tool error regardless of its origin category,
/// except state errors which stay non-recoverable.
pub fn classify(err: &RuntimeError, phase: &str, step_id: u64) -> RuntimeErrorInfo {
    let mut category = err.category();
    if phase.eq_ignore_ascii_case("act") && !matches!(category, ErrorCategory::StateError) {
        category = ErrorCategory::ToolError;
    }
    let recoverable = matches!(
        category,
        ErrorCategory::ModelError | ErrorCategory::ParseError | ErrorCategory::ToolError
    );
    RuntimeErrorInfo {
        category,
        message: err.message().to_string(),
        phase: phase.to_string(),
        step_id,
        recoverable,
        details: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: every stop reason survives a Display -> FromStr round trip.
    #[test]
    fn stop_reason_round_trip() {
        let all = [
            StopReason::Success,
            StopReason::Final,
            StopReason::MaxSteps,
            StopReason::BudgetSteps,
            StopReason::BudgetTime,
            StopReason::BudgetTokens,
            StopReason::AgentCondition,
            StopReason::EnvTerminal,
            StopReason::CriticStop,
            StopReason::TaskValidationFailed,
            StopReason::Stagnation,
            StopReason::UnrecoverableError,
        ];
        for reason in all {
            assert_eq!(reason.as_str().parse::<StopReason>().unwrap(), reason);
        }
        assert!("not_a_reason".parse::<StopReason>().is_err());
    }

    /// **Scenario**: parse and model errors are recoverable; state and system are not.
    #[test]
    fn classification_recoverability() {
        let parse = classify(&RuntimeError::Parse("bad json".into()), "decide", 2);
        assert_eq!(parse.category, ErrorCategory::ParseError);
        assert!(parse.recoverable);

        let model = classify(&RuntimeError::Model("timeout".into()), "decide", 0);
        assert!(model.recoverable);

        let state = classify(&RuntimeError::State("cursor out of range".into()), "reduce", 1);
        assert!(!state.recoverable);

        let system = classify(&RuntimeError::System("boom".into()), "observe", 1);
        assert_eq!(system.category, ErrorCategory::SystemError);
        assert!(!system.recoverable);
    }

    /// **Scenario**: anything raised in the ACT phase classifies as a recoverable tool error.
    #[test]
    fn act_phase_errors_are_tool_errors() {
        let info = classify(&RuntimeError::System("io broke".into()), "ACT", 3);
        assert_eq!(info.category, ErrorCategory::ToolError);
        assert!(info.recoverable);

        let state = classify(&RuntimeError::State("bad".into()), "ACT", 3);
        assert_eq!(state.category, ErrorCategory::StateError);
        assert!(!state.recoverable);
    }
}
