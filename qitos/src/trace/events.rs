//! On-disk trace record shapes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub step_id: u64,
    pub phase: String,
    pub ok: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: String,
}

impl TraceEvent {
    pub fn new(run_id: impl Into<String>, step_id: u64, phase: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_id,
            phase: phase.into(),
            ok: true,
            payload: Value::Object(Map::new()),
            error: None,
            ts: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.ok = false;
        self.error = Some(error.into());
        self
    }
}

/// One line of `steps.jsonl`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_id: u64,
    #[serde(default)]
    pub observation: Value,
    #[serde(default)]
    pub decision: Value,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub action_results: Vec<Value>,
    #[serde(default)]
    pub tool_invocations: Vec<Value>,
    #[serde(default)]
    pub critic_outputs: Vec<Value>,
    #[serde(default)]
    pub state_diff: Map<String, Value>,
}

impl TraceStep {
    pub fn new(step_id: u64) -> Self {
        Self {
            step_id,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: events serialize with every required field present.
    #[test]
    fn event_has_required_fields() {
        let event = TraceEvent::new("run-1", 2, "DECIDE").with_payload(json!({"stage": "start"}));
        let value = serde_json::to_value(&event).unwrap();
        for field in ["run_id", "step_id", "phase", "ok", "payload", "ts"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["ok"], json!(true));
    }

    /// **Scenario**: a failed event keeps ok=false plus the error text.
    #[test]
    fn failed_event() {
        let event = TraceEvent::new("run-1", 0, "DECIDE_ERROR").failed("no parser");
        assert!(!event.ok);
        assert_eq!(event.error.as_deref(), Some("no parser"));
    }
}
