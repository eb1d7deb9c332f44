//! Required-field validation for trace artifacts.

use serde_json::Value;

use super::TraceError;

const REQUIRED_MANIFEST_FIELDS: [&str; 12] = [
    "schema_version",
    "run_id",
    "status",
    "updated_at",
    "step_count",
    "event_count",
    "summary",
    "model_id",
    "prompt_hash",
    "tool_versions",
    "seed",
    "run_config_hash",
];

const REQUIRED_SUMMARY_FIELDS: [&str; 4] =
    ["stop_reason", "final_result", "steps", "failure_report"];

const REQUIRED_EVENT_FIELDS: [&str; 5] = ["run_id", "step_id", "phase", "ok", "ts"];

const REQUIRED_STEP_FIELDS: [&str; 8] = [
    "step_id",
    "observation",
    "decision",
    "actions",
    "action_results",
    "tool_invocations",
    "critic_outputs",
    "state_diff",
];

const VALID_STOP_REASONS: [&str; 12] = [
    "success",
    "final",
    "max_steps",
    "budget_steps",
    "budget_time",
    "budget_tokens",
    "agent_condition",
    "env_terminal",
    "critic_stop",
    "task_validation_failed",
    "stagnation",
    "unrecoverable_error",
];

/// Enforces required fields on every trace record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceSchemaValidator;

impl TraceSchemaValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_manifest(&self, manifest: &Value) -> Result<(), TraceError> {
        require(manifest, &REQUIRED_MANIFEST_FIELDS, "manifest")?;
        let summary = manifest
            .get("summary")
            .and_then(Value::as_object)
            .ok_or_else(|| TraceError::Schema("manifest.summary must be an object".into()))?;
        require(
            &Value::Object(summary.clone()),
            &REQUIRED_SUMMARY_FIELDS,
            "manifest.summary",
        )?;
        if let Some(stop_reason) = summary.get("stop_reason").and_then(Value::as_str) {
            if !VALID_STOP_REASONS.contains(&stop_reason) {
                return Err(TraceError::Schema(format!(
                    "manifest.summary.stop_reason invalid: {stop_reason}"
                )));
            }
        }
        Ok(())
    }

    pub fn validate_events<'a, I>(&self, events: I) -> Result<(), TraceError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        for (idx, event) in events.into_iter().enumerate() {
            require(event, &REQUIRED_EVENT_FIELDS, &format!("event[{idx}]"))?;
        }
        Ok(())
    }

    pub fn validate_steps<'a, I>(&self, steps: I) -> Result<(), TraceError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        for (idx, step) in steps.into_iter().enumerate() {
            require(step, &REQUIRED_STEP_FIELDS, &format!("step[{idx}]"))?;
        }
        Ok(())
    }
}

fn require(payload: &Value, required: &[&str], name: &str) -> Result<(), TraceError> {
    let object = payload
        .as_object()
        .ok_or_else(|| TraceError::Schema(format!("{name} must be an object")))?;
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TraceError::Schema(format!(
            "{name} missing required fields: {missing:?}"
        )))
    }
}
