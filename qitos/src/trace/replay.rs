//! Replay session: cursor navigation over finalized trace artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::writer::read_jsonl;
use super::TraceError;

/// Matches trace events during replay. All set conditions must hold.
pub struct Breakpoint {
    pub step_id: Option<u64>,
    pub phase: Option<String>,
    pub predicate: Option<Box<dyn Fn(&Value) -> bool + Send + Sync>>,
}

impl Breakpoint {
    pub fn at_step(step_id: u64) -> Self {
        Self {
            step_id: Some(step_id),
            phase: None,
            predicate: None,
        }
    }

    pub fn at_phase(phase: impl Into<String>) -> Self {
        Self {
            step_id: None,
            phase: Some(phase.into()),
            predicate: None,
        }
    }

    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            step_id: None,
            phase: None,
            predicate: Some(Box::new(predicate)),
        }
    }

    pub fn matches(&self, event: &Value) -> bool {
        if let Some(step_id) = self.step_id {
            if event.get("step_id").and_then(Value::as_u64) != Some(step_id) {
                return false;
            }
        }
        if let Some(phase) = &self.phase {
            if event.get("phase").and_then(Value::as_str) != Some(phase.as_str()) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

/// Cursor position after a replay movement.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySnapshot {
    pub cursor: usize,
    pub current_event: Option<Value>,
    pub current_step: Option<Value>,
}

/// Per-step inspection payload with a remediation hint derived from tool
/// invocation error categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorPayload {
    pub step_id: i64,
    pub rationale: Option<String>,
    pub decision_mode: Option<String>,
    pub actions: Vec<Value>,
    pub tool_invocations: Vec<Value>,
    pub action_results: Vec<Value>,
    pub critic_outputs: Vec<Value>,
    pub state_diff: Map<String, Value>,
    pub stop_reason: Option<String>,
    pub remediation_hint: Option<String>,
}

/// Build the inspector payload for a raw step record.
pub fn build_inspector_payload(step: &Value, manifest: Option<&Value>) -> InspectorPayload {
    let decision = step.get("decision").cloned().unwrap_or(Value::Null);
    let stop_reason = manifest
        .and_then(|m| m.get("summary"))
        .and_then(|s| s.get("stop_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);
    InspectorPayload {
        step_id: step.get("step_id").and_then(Value::as_i64).unwrap_or(-1),
        rationale: decision
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::to_string),
        decision_mode: decision
            .get("mode")
            .and_then(Value::as_str)
            .map(str::to_string),
        actions: array_field(step, "actions"),
        tool_invocations: array_field(step, "tool_invocations"),
        action_results: array_field(step, "action_results"),
        critic_outputs: array_field(step, "critic_outputs"),
        state_diff: step
            .get("state_diff")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        stop_reason,
        remediation_hint: remediation_hint(step),
    }
}

fn array_field(step: &Value, field: &str) -> Vec<Value> {
    step.get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn remediation_hint(step: &Value) -> Option<String> {
    for invocation in array_field(step, "tool_invocations") {
        if invocation.get("status").and_then(Value::as_str) != Some("error") {
            continue;
        }
        return match invocation.get("error_category").and_then(Value::as_str) {
            Some("tool_not_found") => Some("Verify tool registration and action name.".into()),
            _ => Some("Inspect tool arguments and environment configuration.".into()),
        };
    }
    None
}

/// Loads a run directory back and replays its event stream behind a cursor.
pub struct ReplaySession {
    run_dir: PathBuf,
    pub events: Vec<Value>,
    pub steps: Vec<Value>,
    pub manifest: Value,
    cursor: usize,
}

impl ReplaySession {
    pub fn load(run_dir: &Path) -> Result<Self, TraceError> {
        if !run_dir.is_dir() {
            return Err(TraceError::RunDirNotFound(run_dir.display().to_string()));
        }
        let manifest_path = run_dir.join("manifest.json");
        let manifest = if manifest_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?
        } else {
            Value::Object(Map::new())
        };
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            events: read_jsonl(&run_dir.join("events.jsonl"))?,
            steps: read_jsonl(&run_dir.join("steps.jsonl"))?,
            manifest,
            cursor: 0,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.events.len()
    }

    /// Advance one event.
    pub fn step_into(&mut self) -> ReplaySnapshot {
        if !self.has_next() {
            return ReplaySnapshot {
                cursor: self.cursor,
                current_event: None,
                current_step: None,
            };
        }
        let event = self.events[self.cursor].clone();
        self.cursor += 1;
        let step = self.find_step(event.get("step_id").and_then(Value::as_u64));
        ReplaySnapshot {
            cursor: self.cursor,
            current_event: Some(event),
            current_step: step,
        }
    }

    /// Advance past every event of the current step.
    pub fn step_over(&mut self) -> ReplaySnapshot {
        if !self.has_next() {
            return ReplaySnapshot {
                cursor: self.cursor,
                current_event: None,
                current_step: None,
            };
        }
        let start_step = self.events[self.cursor].get("step_id").and_then(Value::as_u64);
        let mut last_event = None;
        while self.has_next()
            && self.events[self.cursor].get("step_id").and_then(Value::as_u64) == start_step
        {
            last_event = Some(self.events[self.cursor].clone());
            self.cursor += 1;
        }
        ReplaySnapshot {
            cursor: self.cursor,
            current_event: last_event,
            current_step: self.find_step(start_step),
        }
    }

    /// Advance until an event matches one of the breakpoints.
    pub fn run_until_breakpoint(&mut self, breakpoints: &[Breakpoint]) -> ReplaySnapshot {
        while self.has_next() {
            let snapshot = self.step_into();
            if let Some(event) = &snapshot.current_event {
                if breakpoints.iter().any(|bp| bp.matches(event)) {
                    return snapshot;
                }
            }
        }
        ReplaySnapshot {
            cursor: self.cursor,
            current_event: None,
            current_step: None,
        }
    }

    pub fn inspect_step(&self, step_id: u64) -> Option<InspectorPayload> {
        self.find_step(Some(step_id))
            .map(|step| build_inspector_payload(&step, Some(&self.manifest)))
    }

    /// Compact field-level comparison of two step snapshots.
    pub fn compare_steps(&self, step_a: u64, step_b: u64) -> Option<Value> {
        let a = self.find_step(Some(step_a))?;
        let b = self.find_step(Some(step_b))?;
        let mut changes = Map::new();
        for field in [
            "decision",
            "actions",
            "action_results",
            "critic_outputs",
            "state_diff",
        ] {
            let left = a.get(field).cloned().unwrap_or(Value::Null);
            let right = b.get(field).cloned().unwrap_or(Value::Null);
            if left != right {
                changes.insert(field.into(), json!({"a": left, "b": right}));
            }
        }
        Some(json!({
            "step_a": step_a,
            "step_b": step_b,
            "changes": changes,
        }))
    }

    /// Read-only fork: the returned view carries the overridden decision for
    /// one step; nothing on disk changes.
    pub fn fork_with_step_override(&self, step_id: u64, decision_override: Value) -> Value {
        let mut steps = self.steps.clone();
        for step in &mut steps {
            if step.get("step_id").and_then(Value::as_u64) == Some(step_id) {
                if let Some(object) = step.as_object_mut() {
                    object.insert("decision".into(), decision_override);
                }
                break;
            }
        }
        json!({
            "manifest": self.manifest,
            "events": self.events,
            "steps": steps,
        })
    }

    fn find_step(&self, step_id: Option<u64>) -> Option<Value> {
        let step_id = step_id?;
        self.steps
            .iter()
            .find(|step| step.get("step_id").and_then(Value::as_u64) == Some(step_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{RunStatus, TraceEvent, TraceStep, TraceWriter};

    fn write_run(dir: &Path) -> PathBuf {
        let mut writer = TraceWriter::create(dir, "run-x").unwrap();
        for step in 0..2u64 {
            writer
                .write_event(&TraceEvent::new("run-x", step, "OBSERVE"))
                .unwrap();
            writer
                .write_event(&TraceEvent::new("run-x", step, "DECIDE"))
                .unwrap();
            let mut record = TraceStep::new(step);
            record.decision = json!({"mode": "wait", "rationale": "thinking"});
            writer.write_step(&record).unwrap();
        }
        writer
            .finalize(
                RunStatus::Completed,
                json!({"stop_reason": "final", "final_result": "42", "steps": 2}),
            )
            .unwrap();
        dir.join("run-x")
    }

    /// **Scenario**: every written event replays in write order.
    #[test]
    fn replay_order_matches_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = write_run(dir.path());
        let mut session = ReplaySession::load(&run_dir).unwrap();
        let mut seen = Vec::new();
        while session.has_next() {
            let snapshot = session.step_into();
            let event = snapshot.current_event.unwrap();
            seen.push((
                event["step_id"].as_u64().unwrap(),
                event["phase"].as_str().unwrap().to_string(),
            ));
        }
        assert_eq!(
            seen,
            vec![
                (0, "OBSERVE".to_string()),
                (0, "DECIDE".to_string()),
                (1, "OBSERVE".to_string()),
                (1, "DECIDE".to_string()),
            ]
        );
    }

    /// **Scenario**: step_over consumes all events of one step at once.
    #[test]
    fn step_over_whole_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ReplaySession::load(&write_run(dir.path())).unwrap();
        let snapshot = session.step_over();
        assert_eq!(snapshot.cursor, 2);
        assert_eq!(snapshot.current_event.unwrap()["phase"], "DECIDE");
        assert_eq!(snapshot.current_step.unwrap()["step_id"], 0);
    }

    /// **Scenario**: breakpoints stop the cursor on the matching event.
    #[test]
    fn breakpoint_matching() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ReplaySession::load(&write_run(dir.path())).unwrap();
        let snapshot = session.run_until_breakpoint(&[Breakpoint::at_step(1)]);
        let event = snapshot.current_event.unwrap();
        assert_eq!(event["step_id"], 1);

        session.reset();
        let snapshot = session.run_until_breakpoint(&[Breakpoint::when(|event| {
            event["phase"] == "DECIDE"
        })]);
        assert_eq!(snapshot.current_event.unwrap()["phase"], "DECIDE");
    }

    /// **Scenario**: a fork overrides one step's decision in memory only.
    #[test]
    fn fork_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = write_run(dir.path());
        let session = ReplaySession::load(&run_dir).unwrap();
        let fork = session.fork_with_step_override(1, json!({"mode": "final", "final_answer": "43"}));
        assert_eq!(fork["steps"][1]["decision"]["mode"], "final");
        assert_eq!(session.steps[1]["decision"]["mode"], "wait");

        let reread = ReplaySession::load(&run_dir).unwrap();
        assert_eq!(reread.steps[1]["decision"]["mode"], "wait");
    }

    /// **Scenario**: the inspector surfaces decision fields and the run's
    /// stop reason.
    #[test]
    fn inspector_payload() {
        let dir = tempfile::tempdir().unwrap();
        let session = ReplaySession::load(&write_run(dir.path())).unwrap();
        let payload = session.inspect_step(0).unwrap();
        assert_eq!(payload.decision_mode.as_deref(), Some("wait"));
        assert_eq!(payload.rationale.as_deref(), Some("thinking"));
        assert_eq!(payload.stop_reason.as_deref(), Some("final"));
        assert!(payload.remediation_hint.is_none());

        assert!(session.inspect_step(9).is_none());
    }
}
