//! Critics: post-step verifiers deciding continue/retry/stop.
//!
//! Critics compose in order; the first non-continue verdict wins. A critic
//! may write reflection notes into `state.metadata` but must leave the rest
//! of the state alone.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::decision::Decision;
use crate::state::StateSchema;

/// Critic verdict kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticAction {
    Continue,
    Retry,
    Stop,
}

/// Structured critic verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticOutput {
    pub action: CriticAction,
    pub reason: String,
    pub score: f64,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl CriticOutput {
    pub fn proceed(reason: impl Into<String>, score: f64) -> Self {
        Self {
            action: CriticAction::Continue,
            reason: reason.into(),
            score,
            details: Map::new(),
        }
    }

    pub fn retry(reason: impl Into<String>, score: f64) -> Self {
        Self {
            action: CriticAction::Retry,
            reason: reason.into(),
            score,
            details: Map::new(),
        }
    }

    pub fn stop(reason: impl Into<String>, score: f64) -> Self {
        Self {
            action: CriticAction::Stop,
            reason: reason.into(),
            score,
            details: Map::new(),
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

/// Post-hoc verifier over a step's decision and action results.
pub trait Critic: Send + Sync {
    fn evaluate(
        &self,
        state: &mut StateSchema,
        decision: &Decision,
        results: &[Value],
    ) -> CriticOutput;
}

/// Always continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCritic;

impl Critic for PassThroughCritic {
    fn evaluate(
        &self,
        _state: &mut StateSchema,
        _decision: &Decision,
        _results: &[Value],
    ) -> CriticOutput {
        CriticOutput::proceed("pass", 1.0)
    }
}

fn first_error(results: &[Value]) -> Option<&Value> {
    results.iter().find(|result| {
        result
            .as_object()
            .map(|object| object.contains_key("error"))
            .unwrap_or(false)
    })
}

fn read_retries(state: &StateSchema) -> u64 {
    state
        .metadata
        .get("reflection_retries")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Retries steps whose action results carry errors, up to a budget, then
/// stops the run.
pub struct SelfReflectionCritic {
    max_retries: u64,
}

impl SelfReflectionCritic {
    pub fn new(max_retries: u64) -> Self {
        Self { max_retries }
    }
}

impl Default for SelfReflectionCritic {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Critic for SelfReflectionCritic {
    fn evaluate(
        &self,
        state: &mut StateSchema,
        _decision: &Decision,
        results: &[Value],
    ) -> CriticOutput {
        let retries = read_retries(state);
        let has_error = first_error(results).is_some();

        if has_error && retries < self.max_retries {
            state
                .metadata
                .insert("reflection_retries".into(), json!(retries + 1));
            let mut details = Map::new();
            details.insert("retries".into(), json!(retries + 1));
            details.insert("max_retries".into(), json!(self.max_retries));
            return CriticOutput::retry("tool_error_retry", 0.2).with_details(details);
        }
        if has_error {
            return CriticOutput::stop("tool_error_exceeded_retries", 0.0);
        }
        CriticOutput::proceed("reflection_pass", 1.0)
    }
}

/// Like [`SelfReflectionCritic`], but writes structured reflection notes
/// into `state.metadata.self_reflections` for the agent to read next step.
pub struct ReActSelfReflectionCritic {
    max_retries: u64,
}

impl ReActSelfReflectionCritic {
    pub fn new(max_retries: u64) -> Self {
        Self { max_retries }
    }

    fn build_error_reflection(decision: &Decision, error_item: &Value) -> String {
        let action_desc = decision
            .actions()
            .first()
            .map(|action| action.name.clone())
            .unwrap_or_else(|| "no_action".into());
        let error_text = error_item
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        format!(
            "Previous action failed: {action_desc}. Observed error: {error_text}. \
             Next try should adjust tool name/args and keep one atomic tool call."
        )
    }

    fn push_reflection(state: &mut StateSchema, reflection: String) {
        let mut reflections = state
            .metadata
            .get("self_reflections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        reflections.push(Value::String(reflection));
        let keep = reflections.len().saturating_sub(20);
        state
            .metadata
            .insert("self_reflections".into(), Value::Array(reflections.split_off(keep)));
    }
}

impl Default for ReActSelfReflectionCritic {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Critic for ReActSelfReflectionCritic {
    fn evaluate(
        &self,
        state: &mut StateSchema,
        decision: &Decision,
        results: &[Value],
    ) -> CriticOutput {
        let retries = read_retries(state);

        if let Some(error_item) = first_error(results) {
            let reflection = Self::build_error_reflection(decision, error_item);
            Self::push_reflection(state, reflection.clone());
            state
                .metadata
                .insert("reflection_retries".into(), json!(retries + 1));
            let mut details = Map::new();
            details.insert("reflection".into(), json!(reflection));
            details.insert("retry".into(), json!(retries + 1));
            if retries < self.max_retries {
                return CriticOutput::retry("react_reflection_retry", 0.2).with_details(details);
            }
            return CriticOutput::stop("react_reflection_exceeded_retries", 0.0)
                .with_details(details);
        }

        if decision.final_text().is_some() {
            Self::push_reflection(
                state,
                "Final answer produced. Verify constraints satisfied.".into(),
            );
        }
        CriticOutput::proceed("react_reflection_pass", 1.0)
    }
}
