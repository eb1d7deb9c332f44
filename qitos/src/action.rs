//! Normalized action contract emitted by policies and consumed by the executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What an action addresses. Only tool invocations exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Tool,
}

/// Outcome status of one executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
            ActionStatus::Skipped => "skipped",
        }
    }
}

/// A request to invoke one tool by registry name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub idempotent: bool,
    #[serde(default = "default_classification")]
    pub classification: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_classification() -> String {
    "default".to_string()
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
            kind: ActionKind::Tool,
            action_id: None,
            timeout_s: None,
            max_retries: 0,
            idempotent: true,
            classification: default_classification(),
            metadata: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: f64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    /// Normalize a loose JSON object (e.g. parser output) into an action.
    /// Missing fields take their defaults; a missing name becomes empty and
    /// fails later at dispatch.
    pub fn from_value(value: &Value) -> Self {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = value
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut action = Action::new(name).with_args(args);
        if let Some(id) = value.get("action_id").and_then(Value::as_str) {
            action.action_id = Some(id.to_string());
        }
        if let Some(t) = value.get("timeout_s").and_then(Value::as_f64) {
            action.timeout_s = Some(t);
        }
        if let Some(r) = value.get("max_retries").and_then(Value::as_u64) {
            action.max_retries = r as u32;
        }
        if let Some(i) = value.get("idempotent").and_then(Value::as_bool) {
            action.idempotent = i;
        }
        if let Some(c) = value.get("classification").and_then(Value::as_str) {
            action.classification = c.to_string();
        }
        if let Some(m) = value.get("metadata").and_then(Value::as_object) {
            action.metadata = m.clone();
        }
        action
    }
}

/// Standardized result of one executed action, provenance included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub attempts: u32,
    pub latency_ms: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    /// The payload the agent sees in `reduce`: the output on success, an
    /// `{"error": ...}` object otherwise.
    pub fn payload(&self) -> Value {
        match self.status {
            ActionStatus::Success => self.output.clone().unwrap_or(Value::Null),
            _ => serde_json::json!({
                "error": self.error.clone().unwrap_or_else(|| "unknown action execution error".into())
            }),
        }
    }
}

/// Executor policy for action batches. The parallel mode is a declared knob:
/// execution stays serial and result order is the action order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub mode: ExecutionMode,
    pub fail_fast: bool,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Serial,
            fail_fast: false,
            max_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: loose parser output normalizes with defaults preserved.
    #[test]
    fn action_from_value_defaults() {
        let action = Action::from_value(&json!({
            "name": "add",
            "args": {"a": 40, "b": 2},
        }));
        assert_eq!(action.name, "add");
        assert_eq!(action.args["a"], json!(40));
        assert_eq!(action.max_retries, 0);
        assert!(action.idempotent);
        assert_eq!(action.classification, "default");
        assert_eq!(action.kind, ActionKind::Tool);
    }

    /// **Scenario**: explicit retry/timeout fields survive normalization.
    #[test]
    fn action_from_value_explicit_fields() {
        let action = Action::from_value(&json!({
            "name": "fetch",
            "timeout_s": 1.5,
            "max_retries": 2,
            "idempotent": false,
        }));
        assert_eq!(action.timeout_s, Some(1.5));
        assert_eq!(action.max_retries, 2);
        assert!(!action.idempotent);
    }

    /// **Scenario**: error results surface an error payload, success the raw output.
    #[test]
    fn result_payload_by_status() {
        let ok = ActionResult {
            name: "add".into(),
            status: ActionStatus::Success,
            output: Some(json!(42)),
            error: None,
            action_id: None,
            attempts: 1,
            latency_ms: 0.2,
            metadata: Map::new(),
        };
        assert_eq!(ok.payload(), json!(42));

        let err = ActionResult {
            status: ActionStatus::Error,
            output: None,
            error: Some("division by zero".into()),
            ..ok
        };
        assert_eq!(err.payload()["error"], "division by zero");
    }
}
