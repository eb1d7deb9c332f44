//! Standalone HTML export of one run.

use std::path::Path;

use serde_json::Value;

use crate::runs::{load_run_payload, CliError};

/// Render a self-contained HTML page embedding the run payload. The same
/// renderer backs the board's run page and the exported file.
pub fn render_run_html(payload: &Value, embedded: bool) -> String {
    let run_id = payload
        .get("run_id")
        .and_then(Value::as_str)
        .unwrap_or("run");
    let title = html_escape::encode_text(run_id);
    let data = json_for_script(payload);
    let source_note = if embedded {
        "exported snapshot"
    } else {
        "live board"
    };
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>qita · {title}</title>
<style>
  body {{ font-family: ui-monospace, monospace; margin: 1.5rem; background: #101418; color: #d8dee4; }}
  h1 {{ font-size: 1.1rem; }}
  .meta {{ color: #8b97a3; margin-bottom: 1rem; }}
  details {{ margin: .4rem 0; border: 1px solid #2a313a; border-radius: 6px; padding: .4rem .6rem; }}
  summary {{ cursor: pointer; }}
  .ok {{ color: #7ccf8f; }}
  .err {{ color: #e06c75; }}
  pre {{ white-space: pre-wrap; word-break: break-word; background: #161c22; padding: .5rem; border-radius: 4px; }}
</style>
</head>
<body>
<h1>qita run · {title}</h1>
<div class="meta" id="meta">{source_note}</div>
<div id="steps"></div>
<h2>events</h2>
<div id="events"></div>
<script id="run-data" type="application/json">{data}</script>
<script>
  const payload = JSON.parse(document.getElementById("run-data").textContent);
  const manifest = payload.manifest || {{}};
  const summary = manifest.summary || {{}};
  document.getElementById("meta").textContent =
    `status=${{manifest.status}} stop_reason=${{summary.stop_reason}} ` +
    `steps=${{manifest.step_count}} events=${{manifest.event_count}} ({source_note})`;

  const steps = document.getElementById("steps");
  for (const step of payload.steps || []) {{
    const box = document.createElement("details");
    const mode = step.decision && step.decision.mode ? step.decision.mode : "-";
    box.innerHTML = `<summary>step ${{step.step_id}} · ${{mode}}</summary>` +
      `<pre>${{JSON.stringify(step, null, 2)}}</pre>`;
    steps.appendChild(box);
  }}

  const events = document.getElementById("events");
  for (const event of payload.events || []) {{
    const line = document.createElement("div");
    line.className = event.ok ? "ok" : "err";
    line.textContent = `[${{event.step_id}}] ${{event.phase}}` +
      (event.error ? ` — ${{event.error}}` : "");
    events.appendChild(line);
  }}
</script>
</body>
</html>
"#
    )
}

/// Write one run as a standalone HTML file.
pub fn export_run(run_dir: &Path, html_path: &Path) -> Result<(), CliError> {
    let payload = load_run_payload(run_dir)?;
    if let Some(parent) = html_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(html_path, render_run_html(&payload, true))?;
    Ok(())
}

/// Serialize a payload for embedding inside a `<script>` tag.
fn json_for_script(payload: &Value) -> String {
    serde_json::to_string(payload)
        .unwrap_or_else(|_| "{}".into())
        .replace("</", "<\\/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: the export embeds the payload and closes script tags
    /// safely.
    #[test]
    fn render_embeds_payload() {
        let payload = json!({
            "run_id": "run-1",
            "manifest": {"status": "completed", "step_count": 1, "event_count": 2,
                         "summary": {"stop_reason": "final"}},
            "events": [{"step_id": 0, "phase": "INIT", "ok": true}],
            "steps": [{"step_id": 0, "decision": {"mode": "final"}}],
        });
        let html = render_run_html(&payload, true);
        assert!(html.contains("qita run · run-1"));
        assert!(html.contains("\"phase\":\"INIT\""));

        let sneaky = json!({"run_id": "x", "events": [{"phase": "</script><script>alert(1)"}]});
        let html = render_run_html(&sneaky, true);
        assert!(!html.contains("</script><script>alert(1)"));
    }

    /// **Scenario**: exporting a missing run dir fails with a clear error.
    #[test]
    fn export_missing_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_run(&dir.path().join("nope"), &dir.path().join("out.html")).unwrap_err();
        assert!(matches!(err, CliError::RunDirNotFound(_)));
    }
}
