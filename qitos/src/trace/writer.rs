//! Append-only JSONL writer with a finalize-time manifest.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::events::{TraceEvent, TraceStep};
use super::schema::TraceSchemaValidator;
use super::TraceError;

/// Manifest run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Writes one run's trace. The writer is the only writer of its files and
/// never rewrites `events.jsonl`/`steps.jsonl`; the manifest alone is
/// replaced atomically at finalize. Every line is flushed as it is written
/// so a crashed process leaves a readable prefix.
pub struct TraceWriter {
    run_id: String,
    run_dir: PathBuf,
    schema_version: String,
    metadata: Map<String, Value>,
    strict_validate: bool,
    events_file: Mutex<File>,
    steps_file: Mutex<File>,
    event_count: u64,
    step_count: u64,
}

impl TraceWriter {
    /// Create the run directory and open the artifact files. The manifest is
    /// written immediately with status `running`.
    pub fn create(output_dir: &Path, run_id: impl Into<String>) -> Result<Self, TraceError> {
        let run_id = run_id.into();
        let run_dir = output_dir.join(&run_id);
        std::fs::create_dir_all(&run_dir)?;
        let events_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("events.jsonl"))?;
        let steps_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("steps.jsonl"))?;
        let writer = Self {
            run_id,
            run_dir,
            schema_version: "v1".into(),
            metadata: Map::new(),
            strict_validate: true,
            events_file: Mutex::new(events_file),
            steps_file: Mutex::new(steps_file),
            event_count: 0,
            step_count: 0,
        };
        writer.write_manifest(RunStatus::Running, &Value::Object(Map::new()))?;
        Ok(writer)
    }

    /// Run metadata recorded into the manifest (`model_id`, `prompt_hash`,
    /// `tool_versions`, `seed`, `run_config_hash`).
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Disable finalize-time re-read validation.
    pub fn with_strict_validate(mut self, strict: bool) -> Self {
        self.strict_validate = strict;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn write_event(&mut self, event: &TraceEvent) -> Result<(), TraceError> {
        let line = serde_json::to_string(event)?;
        let mut file = self
            .events_file
            .lock()
            .map_err(|_| TraceError::Schema("events file lock poisoned".into()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        self.event_count += 1;
        Ok(())
    }

    pub fn write_step(&mut self, step: &TraceStep) -> Result<(), TraceError> {
        let line = serde_json::to_string(step)?;
        let mut file = self
            .steps_file
            .lock()
            .map_err(|_| TraceError::Schema("steps file lock poisoned".into()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        self.step_count += 1;
        Ok(())
    }

    /// Rewrite the manifest with the terminal status and, in strict mode,
    /// re-read and validate all three artifacts.
    pub fn finalize(&mut self, status: RunStatus, summary: Value) -> Result<(), TraceError> {
        self.write_manifest(status, &summary)?;
        if self.strict_validate && status != RunStatus::Running {
            self.validate_artifacts()?;
        }
        Ok(())
    }

    fn write_manifest(&self, status: RunStatus, summary: &Value) -> Result<(), TraceError> {
        let mut merged = json!({
            "stop_reason": null,
            "final_result": null,
            "steps": self.step_count,
            "failure_report": {},
        });
        if let (Some(merged_map), Some(summary_map)) = (merged.as_object_mut(), summary.as_object())
        {
            for (key, value) in summary_map {
                merged_map.insert(key.clone(), value.clone());
            }
        }
        let manifest = json!({
            "schema_version": self.schema_version,
            "run_id": self.run_id,
            "status": status.as_str(),
            "updated_at": Utc::now().to_rfc3339(),
            "event_count": self.event_count,
            "step_count": self.step_count,
            "summary": merged,
            "model_id": self.metadata.get("model_id").cloned().unwrap_or(json!("unknown")),
            "prompt_hash": self.metadata.get("prompt_hash").cloned().unwrap_or(json!("unknown")),
            "tool_versions": self.metadata.get("tool_versions").cloned().unwrap_or(json!({})),
            "seed": self.metadata.get("seed").cloned().unwrap_or(Value::Null),
            "run_config_hash": self.metadata.get("run_config_hash").cloned().unwrap_or(json!("unknown")),
        });

        // Atomic replace: the manifest is the only rewritable artifact.
        let tmp_path = self.run_dir.join("manifest.json.tmp");
        let final_path = self.run_dir.join("manifest.json");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        tmp.flush()?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn validate_artifacts(&self) -> Result<(), TraceError> {
        let validator = TraceSchemaValidator::new();
        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(self.run_dir.join("manifest.json"))?)?;
        validator.validate_manifest(&manifest)?;

        let events = read_jsonl(&self.run_dir.join("events.jsonl"))?;
        validator.validate_events(events.iter())?;
        let steps = read_jsonl(&self.run_dir.join("steps.jsonl"))?;
        validator.validate_steps(steps.iter())?;

        if manifest["event_count"].as_u64() != Some(events.len() as u64) {
            return Err(TraceError::Schema(format!(
                "manifest.event_count={} but events.jsonl has {} lines",
                manifest["event_count"], events.len()
            )));
        }
        if manifest["step_count"].as_u64() != Some(steps.len() as u64) {
            return Err(TraceError::Schema(format!(
                "manifest.step_count={} but steps.jsonl has {} lines",
                manifest["step_count"], steps.len()
            )));
        }
        Ok(())
    }
}

pub(crate) fn read_jsonl(path: &Path) -> Result<Vec<Value>, TraceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: counts on the finalized manifest match line counts, and
    /// strict validation passes on a well-formed run.
    #[test]
    fn write_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TraceWriter::create(dir.path(), "run-1").unwrap();
        writer
            .write_event(&TraceEvent::new("run-1", 0, "INIT"))
            .unwrap();
        writer
            .write_event(&TraceEvent::new("run-1", 0, "OBSERVE"))
            .unwrap();
        writer.write_step(&TraceStep::new(0)).unwrap();
        writer
            .finalize(
                RunStatus::Completed,
                json!({"stop_reason": "final", "final_result": "42", "steps": 1}),
            )
            .unwrap();

        let manifest: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("run-1/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["event_count"], 2);
        assert_eq!(manifest["step_count"], 1);
        assert_eq!(manifest["summary"]["final_result"], "42");
        assert_eq!(manifest["summary"]["failure_report"], json!({}));
    }

    /// **Scenario**: events append in write order, one JSON object per line.
    #[test]
    fn append_only_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TraceWriter::create(dir.path(), "run-2").unwrap();
        for step in 0..3u64 {
            writer
                .write_event(&TraceEvent::new("run-2", step, "OBSERVE"))
                .unwrap();
        }
        let events = read_jsonl(&dir.path().join("run-2/events.jsonl")).unwrap();
        let steps: Vec<u64> = events
            .iter()
            .map(|e| e["step_id"].as_u64().unwrap())
            .collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    /// **Scenario**: re-finalizing an already-final run revalidates cleanly
    /// without touching the jsonl files.
    #[test]
    fn finalize_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TraceWriter::create(dir.path(), "run-3").unwrap();
        writer
            .write_event(&TraceEvent::new("run-3", 0, "INIT"))
            .unwrap();
        let summary = json!({"stop_reason": "final", "final_result": "ok", "steps": 0});
        writer.finalize(RunStatus::Completed, summary.clone()).unwrap();
        let before = std::fs::read_to_string(dir.path().join("run-3/events.jsonl")).unwrap();
        writer.finalize(RunStatus::Completed, summary).unwrap();
        let after = std::fs::read_to_string(dir.path().join("run-3/events.jsonl")).unwrap();
        assert_eq!(before, after);
    }
}
