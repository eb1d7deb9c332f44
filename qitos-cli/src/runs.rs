//! Run discovery and payload loading over trace run directories.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

/// CLI failure surfaced to the user with a nonzero exit.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("run dir not found: {0}")]
    RunDirNotFound(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serve: {0}")]
    Serve(String),
}

/// Every direct child of the log root that carries a manifest, newest
/// shape the board's list view needs.
pub fn discover_runs(logdir: &Path) -> Vec<Value> {
    let mut runs = Vec::new();
    let Ok(entries) = std::fs::read_dir(logdir) else {
        return runs;
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    for dir in dirs {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            continue;
        }
        let manifest = load_json(&manifest_path);
        let summary = manifest.get("summary").cloned().unwrap_or(Value::Null);
        runs.push(json!({
            "id": dir.file_name().and_then(|name| name.to_str()),
            "path": dir.display().to_string(),
            "status": manifest.get("status"),
            "updated_at": manifest.get("updated_at"),
            "step_count": manifest.get("step_count").cloned().unwrap_or(json!(0)),
            "event_count": manifest.get("event_count").cloned().unwrap_or(json!(0)),
            "stop_reason": summary.get("stop_reason"),
            "final_result": summary.get("final_result"),
            "manifest_meta": {
                "schema_version": manifest.get("schema_version"),
                "model_id": manifest.get("model_id"),
                "prompt_hash": manifest.get("prompt_hash"),
                "run_config_hash": manifest.get("run_config_hash"),
                "seed": manifest.get("seed"),
                "summary_steps": summary.get("steps"),
            },
        }));
    }
    runs
}

/// Full run payload for the run/replay pages and the export.
pub fn load_run_payload(run_dir: &Path) -> Result<Value, CliError> {
    if !run_dir.is_dir() {
        return Err(CliError::RunDirNotFound(run_dir.to_path_buf()));
    }
    let manifest = load_json(&run_dir.join("manifest.json"));
    let events = load_jsonl(&run_dir.join("events.jsonl"));
    let steps = load_jsonl(&run_dir.join("steps.jsonl"));
    let events_by_step = group_events_by_step(&events);
    let inspector: Vec<Value> = steps
        .iter()
        .map(|step| {
            serde_json::to_value(qitos::build_inspector_payload(step, Some(&manifest)))
                .unwrap_or(Value::Null)
        })
        .collect();
    Ok(json!({
        "run": run_dir.display().to_string(),
        "run_id": run_dir.file_name().and_then(|name| name.to_str()),
        "manifest": manifest,
        "events": events,
        "steps": steps,
        "events_by_step": events_by_step,
        "inspector": inspector,
    }))
}

/// Resolve a run id strictly to a direct child of the root.
pub fn resolve_run(root: &Path, run_id: &str) -> Option<PathBuf> {
    let slug = slug_run_id(run_id);
    if slug.is_empty() || slug.chars().all(|c| c == '.') {
        return None;
    }
    let run_dir = root.join(&slug);
    if run_dir.is_dir() {
        Some(run_dir)
    } else {
        None
    }
}

/// Keep only filename-safe characters of a run id.
pub fn slug_run_id(run_id: &str) -> String {
    run_id
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

fn group_events_by_step(events: &[Value]) -> Map<String, Value> {
    let mut grouped: Map<String, Value> = Map::new();
    for event in events {
        let step = event
            .get("step_id")
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".into());
        let bucket = grouped.entry(step).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = bucket {
            items.push(event.clone());
        }
    }
    grouped
}

fn load_json(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn load_jsonl(path: &Path) -> Vec<Value> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|_| json!({"raw": line, "error": "invalid_json"}))
        })
        .collect()
}
