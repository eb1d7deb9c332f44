//! Typed state schema carried across engine steps.
//!
//! [`StateSchema`] is the canonical base record: step counters, final result,
//! stop reason, metadata/memory/metrics maps and a plan block. Agents extend
//! it by composition — embed a `StateSchema` in your own state struct and
//! implement [`AgentState`] so the engine can reach the base fields and
//! serialize the whole state for diffing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StopReason;

/// State validation or migration failure. Non-recoverable by taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("state validation: {0}")]
    Validation(String),
    #[error("state migration: {0}")]
    Migration(String),
}

/// Plan execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Idle,
    Executing,
    Completed,
}

/// Structured plan state for planner-executor style agents. Agents that do
/// not plan leave it idle with empty steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanState {
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub cursor: usize,
    #[serde(default)]
    pub status: PlanStatus,
}

/// Canonical typed state base for agent modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    pub schema_version: u32,
    pub task: String,
    pub current_step: u64,
    pub max_steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub memory: Map<String, Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub plan: PlanState,
}

impl Default for StateSchema {
    fn default() -> Self {
        Self {
            schema_version: 1,
            task: String::new(),
            current_step: 0,
            max_steps: 10,
            final_result: None,
            stop_reason: None,
            metadata: Map::new(),
            memory: Map::new(),
            metrics: Map::new(),
            plan: PlanState::default(),
        }
    }
}

impl StateSchema {
    pub fn new(task: impl Into<String>, max_steps: u64) -> Self {
        Self {
            task: task.into(),
            max_steps,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.max_steps == 0 {
            return Err(StateError::Validation("max_steps must be > 0".into()));
        }
        if self.current_step > self.max_steps {
            return Err(StateError::Validation(format!(
                "current_step={} cannot exceed max_steps={}",
                self.current_step, self.max_steps
            )));
        }
        if self.stop_reason == Some(StopReason::Final) && self.final_result.is_none() {
            return Err(StateError::Validation(
                "stop_reason=final requires final_result".into(),
            ));
        }
        if self.plan.cursor > self.plan.steps.len() {
            return Err(StateError::Validation(
                "plan.cursor cannot exceed number of plan steps".into(),
            ));
        }
        Ok(())
    }

    /// Terminal transition, engine-controlled.
    pub fn set_stop(&mut self, reason: StopReason, final_result: Option<String>) {
        self.stop_reason = Some(reason);
        if let Some(result) = final_result {
            self.final_result = Some(result);
        }
    }

    pub fn advance_step(&mut self) -> Result<(), StateError> {
        self.current_step += 1;
        self.validate()
    }

    pub fn mark_plan_executing(&mut self, steps: Vec<String>) {
        self.plan.status = if steps.is_empty() {
            PlanStatus::Idle
        } else {
            PlanStatus::Executing
        };
        self.plan.steps = steps;
        self.plan.cursor = 0;
    }

    pub fn mark_plan_step_done(&mut self) {
        if self.plan.cursor < self.plan.steps.len() {
            self.plan.cursor += 1;
        }
        if !self.plan.steps.is_empty() && self.plan.cursor >= self.plan.steps.len() {
            self.plan.status = PlanStatus::Completed;
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Deserialize a state payload. In strict mode unknown top-level fields
    /// are rejected instead of dropped.
    pub fn from_value(payload: &Value, strict: bool) -> Result<Self, StateError> {
        if strict {
            let known = [
                "schema_version",
                "task",
                "current_step",
                "max_steps",
                "final_result",
                "stop_reason",
                "metadata",
                "memory",
                "metrics",
                "plan",
            ];
            if let Some(object) = payload.as_object() {
                let unknown: Vec<&String> = object
                    .keys()
                    .filter(|key| !known.contains(&key.as_str()))
                    .collect();
                if !unknown.is_empty() {
                    return Err(StateError::Validation(format!(
                        "unknown state fields: {unknown:?}"
                    )));
                }
            }
        }
        let state: StateSchema = serde_json::from_value(payload.clone())
            .map_err(|e| StateError::Validation(e.to_string()))?;
        state.validate()?;
        Ok(state)
    }
}

/// Contract between the engine and a user-defined state type.
///
/// `to_value` feeds the per-step state diff, so it must cover the extension
/// fields too; the serde-derived default does.
pub trait AgentState: Clone + Serialize + Send + Sync + 'static {
    fn base(&self) -> &StateSchema;
    fn base_mut(&mut self) -> &mut StateSchema;

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl AgentState for StateSchema {
    fn base(&self) -> &StateSchema {
        self
    }

    fn base_mut(&mut self) -> &mut StateSchema {
        self
    }
}

/// Per-key before/after diff over two serialized state snapshots.
pub fn diff_values(before: &Value, after: &Value) -> Map<String, Value> {
    let empty = Map::new();
    let before_map = before.as_object().unwrap_or(&empty);
    let after_map = after.as_object().unwrap_or(&empty);
    let mut diff = Map::new();
    let mut keys: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let b = before_map.get(key).cloned().unwrap_or(Value::Null);
        let a = after_map.get(key).cloned().unwrap_or(Value::Null);
        if b != a {
            diff.insert(
                key.clone(),
                serde_json::json!({ "before": b, "after": a }),
            );
        }
    }
    diff
}

type MigrationFn = Box<dyn Fn(Value) -> Result<Value, StateError> + Send + Sync>;

/// In-process migration graph for state schema versions. Migrations are
/// registered per single-version hop and chained; a missing hop is an error.
#[derive(Default)]
pub struct StateMigrationRegistry {
    migrations: HashMap<(u32, u32), MigrationFn>,
}

impl StateMigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, from: u32, to: u32, migrate: F) -> Result<(), StateError>
    where
        F: Fn(Value) -> Result<Value, StateError> + Send + Sync + 'static,
    {
        if to <= from {
            return Err(StateError::Migration(
                "to_version must be greater than from_version".into(),
            ));
        }
        self.migrations.insert((from, to), Box::new(migrate));
        Ok(())
    }

    pub fn migrate(&self, payload: Value, from: u32, to: u32) -> Result<Value, StateError> {
        if from == to {
            return Ok(payload);
        }
        let mut current = from;
        let mut output = payload;
        while current < to {
            let step = (current, current + 1);
            let migrate = self.migrations.get(&step).ok_or_else(|| {
                StateError::Migration(format!(
                    "missing migration path from v{} to v{}",
                    current,
                    current + 1
                ))
            })?;
            output = migrate(output)?;
            current += 1;
        }
        if let Some(object) = output.as_object_mut() {
            object.insert("schema_version".into(), Value::from(to));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: step bounds and final consistency are enforced.
    #[test]
    fn validate_bounds() {
        let mut state = StateSchema::new("t", 2);
        assert!(state.validate().is_ok());
        state.current_step = 3;
        assert!(state.validate().is_err());

        let mut state = StateSchema::new("t", 2);
        state.stop_reason = Some(StopReason::Final);
        assert!(state.validate().is_err());
        state.final_result = Some("42".into());
        assert!(state.validate().is_ok());
    }

    /// **Scenario**: strict from_value rejects unknown fields, lax drops them.
    #[test]
    fn from_value_strictness() {
        let payload = json!({
            "schema_version": 1,
            "task": "t",
            "current_step": 0,
            "max_steps": 5,
            "bogus": true,
        });
        assert!(StateSchema::from_value(&payload, true).is_err());
        let state = StateSchema::from_value(&payload, false).unwrap();
        assert_eq!(state.max_steps, 5);
    }

    /// **Scenario**: plan helpers walk idle -> executing -> completed.
    #[test]
    fn plan_lifecycle() {
        let mut state = StateSchema::new("t", 5);
        assert_eq!(state.plan.status, PlanStatus::Idle);
        state.mark_plan_executing(vec!["read".into(), "edit".into()]);
        assert_eq!(state.plan.status, PlanStatus::Executing);
        state.mark_plan_step_done();
        assert_eq!(state.plan.cursor, 1);
        state.mark_plan_step_done();
        assert_eq!(state.plan.status, PlanStatus::Completed);
    }

    /// **Scenario**: diff reports only changed keys with before/after pairs.
    #[test]
    fn diff_changed_keys_only() {
        let mut state = StateSchema::new("t", 5);
        let before = state.to_value();
        state.current_step = 1;
        state.final_result = Some("42".into());
        let after = state.to_value();
        let diff = diff_values(&before, &after);
        assert!(diff.contains_key("current_step"));
        assert!(diff.contains_key("final_result"));
        assert!(!diff.contains_key("task"));
        assert_eq!(diff["current_step"]["after"], json!(1));
    }

    /// **Scenario**: migrations chain single-version hops and stamp the target version.
    #[test]
    fn migration_chain() {
        let mut registry = StateMigrationRegistry::new();
        registry
            .register(1, 2, |mut v| {
                v["metadata"]["migrated"] = json!(true);
                Ok(v)
            })
            .unwrap();
        registry
            .register(2, 3, |mut v| {
                v["metadata"]["again"] = json!(true);
                Ok(v)
            })
            .unwrap();
        let migrated = registry
            .migrate(StateSchema::new("t", 3).to_value(), 1, 3)
            .unwrap();
        assert_eq!(migrated["schema_version"], json!(3));
        assert_eq!(migrated["metadata"]["migrated"], json!(true));
        assert_eq!(migrated["metadata"]["again"], json!(true));

        let missing = registry.migrate(json!({}), 3, 5);
        assert!(missing.is_err());
    }

    /// **Scenario**: registering a non-forward migration fails.
    #[test]
    fn migration_rejects_backwards() {
        let mut registry = StateMigrationRegistry::new();
        assert!(registry.register(2, 2, Ok).is_err());
        assert!(registry.register(3, 1, Ok).is_err());
    }
}
