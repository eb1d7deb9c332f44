//! FSM state and event model for the engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::Action;
use crate::decision::Decision;
use crate::trace::{TraceEvent, TraceStep};

/// Engine phases in canonical order, plus the error/recover phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimePhase {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "OBSERVE")]
    Observe,
    #[serde(rename = "DECIDE")]
    Decide,
    #[serde(rename = "ACT")]
    Act,
    #[serde(rename = "REDUCE")]
    Reduce,
    #[serde(rename = "CRITIC")]
    Critic,
    #[serde(rename = "CHECK_STOP")]
    CheckStop,
    #[serde(rename = "END")]
    End,
    #[serde(rename = "DECIDE_ERROR")]
    DecideError,
    #[serde(rename = "ACT_ERROR")]
    ActError,
    #[serde(rename = "RECOVER")]
    Recover,
}

impl RuntimePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimePhase::Init => "INIT",
            RuntimePhase::Observe => "OBSERVE",
            RuntimePhase::Decide => "DECIDE",
            RuntimePhase::Act => "ACT",
            RuntimePhase::Reduce => "REDUCE",
            RuntimePhase::Critic => "CRITIC",
            RuntimePhase::CheckStop => "CHECK_STOP",
            RuntimePhase::End => "END",
            RuntimePhase::DecideError => "DECIDE_ERROR",
            RuntimePhase::ActError => "ACT_ERROR",
            RuntimePhase::Recover => "RECOVER",
        }
    }
}

impl std::fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run resource budget. Task budgets override these at INIT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeBudget {
    pub max_steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl Default for RuntimeBudget {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_runtime_seconds: None,
            max_tokens: None,
        }
    }
}

impl RuntimeBudget {
    pub fn with_max_steps(max_steps: u64) -> Self {
        Self {
            max_steps,
            ..Self::default()
        }
    }
}

/// One in-memory runtime event; mirrored into the trace as it is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub step_id: u64,
    pub phase: RuntimePhase,
    pub ok: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: String,
}

impl RuntimeEvent {
    pub fn new(step_id: u64, phase: RuntimePhase) -> Self {
        Self {
            step_id,
            phase,
            ok: true,
            payload: Value::Object(Map::new()),
            error: None,
            ts: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_trace(&self, run_id: &str) -> TraceEvent {
        TraceEvent {
            run_id: run_id.to_string(),
            step_id: self.step_id,
            phase: self.phase.as_str().to_string(),
            ok: self.ok,
            payload: self.payload.clone(),
            error: self.error.clone(),
            ts: self.ts.clone(),
        }
    }
}

/// Everything one step produced.
#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    pub step_id: u64,
    pub observation: Value,
    pub decision: Option<Decision>,
    pub actions: Vec<Action>,
    pub action_results: Vec<Value>,
    pub tool_invocations: Vec<Value>,
    pub critic_outputs: Vec<Value>,
    pub state_diff: Map<String, Value>,
}

impl StepRecord {
    pub fn new(step_id: u64) -> Self {
        Self {
            step_id,
            ..Self::default()
        }
    }

    pub fn to_trace(&self) -> TraceStep {
        TraceStep {
            step_id: self.step_id,
            observation: self.observation.clone(),
            decision: self
                .decision
                .as_ref()
                .and_then(|decision| serde_json::to_value(decision).ok())
                .unwrap_or(Value::Null),
            actions: self
                .actions
                .iter()
                .filter_map(|action| serde_json::to_value(action).ok())
                .collect(),
            action_results: self.action_results.clone(),
            tool_invocations: self.tool_invocations.clone(),
            critic_outputs: self.critic_outputs.clone(),
            state_diff: self.state_diff.clone(),
        }
    }
}
