//! Web board: serve discovered runs and per-run pages over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::export::render_run_html;
use crate::runs::{discover_runs, load_run_payload, resolve_run, CliError};

#[derive(Clone)]
pub struct BoardState {
    pub root: PathBuf,
}

/// Router over a log root; exposed separately so tests can drive it without
/// binding a socket.
pub fn build_router(root: PathBuf) -> Router {
    let state = Arc::new(BoardState { root });
    Router::new()
        .route("/", get(index_page))
        .route("/api/runs", get(api_runs))
        .route("/api/run/:id", get(api_run))
        .route("/run/:id", get(run_page))
        .route("/replay/:id", get(replay_page))
        .with_state(state)
}

/// Serve the board until interrupted.
pub async fn serve(root: PathBuf, host: &str, port: u16) -> Result<(), CliError> {
    std::fs::create_dir_all(&root)?;
    let runs = discover_runs(&root);
    info!(logdir = %root.display(), runs = runs.len(), "qita board starting");
    println!("[qita] board logdir: {}", root.display());
    println!("[qita] runs discovered: {}", runs.len());
    println!("[qita] open: http://{host}:{port}/");

    let app = build_router(root);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| CliError::Serve(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(CliError::Io)?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CliError::Serve(e.to_string()))
}

async fn index_page(State(state): State<Arc<BoardState>>) -> Html<String> {
    let runs = discover_runs(&state.root);
    let mut rows = String::new();
    for run in &runs {
        let id = run["id"].as_str().unwrap_or("?");
        let safe_id = html_escape::encode_text(id);
        rows.push_str(&format!(
            "<tr><td><a href=\"/run/{safe_id}\">{safe_id}</a></td><td>{}</td><td>{}</td>\
             <td>{}</td><td><a href=\"/replay/{safe_id}\">replay</a></td></tr>\n",
            html_escape::encode_text(run["status"].as_str().unwrap_or("-")),
            html_escape::encode_text(run["stop_reason"].as_str().unwrap_or("-")),
            run["step_count"],
        ));
    }
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>qita board</title>
<style>
  body {{ font-family: ui-monospace, monospace; margin: 1.5rem; background: #101418; color: #d8dee4; }}
  table {{ border-collapse: collapse; }}
  td, th {{ border: 1px solid #2a313a; padding: .3rem .7rem; }}
  a {{ color: #61afef; }}
</style>
</head>
<body>
<h1>qita board</h1>
<p>{} run(s)</p>
<table>
<tr><th>run</th><th>status</th><th>stop_reason</th><th>steps</th><th></th></tr>
{rows}
</table>
</body>
</html>
"#,
        runs.len()
    ))
}

async fn api_runs(State(state): State<Arc<BoardState>>) -> Json<serde_json::Value> {
    Json(json!({ "runs": discover_runs(&state.root) }))
}

async fn api_run(
    State(state): State<Arc<BoardState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match resolve_run(&state.root, &id).and_then(|dir| load_run_payload(&dir).ok()) {
        Some(payload) => Json(payload).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "run not found", "run_id": id})),
        )
            .into_response(),
    }
}

async fn run_page(
    State(state): State<Arc<BoardState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    render_page(&state, &id)
}

async fn replay_page(
    State(state): State<Arc<BoardState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    // The replay view renders the same payload; navigation is client-side.
    render_page(&state, &id)
}

fn render_page(state: &BoardState, id: &str) -> Response {
    match resolve_run(&state.root, id).and_then(|dir| load_run_payload(&dir).ok()) {
        Some(payload) => Html(render_run_html(&payload, false)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Html(format!(
                "<h1>run not found: {}</h1>",
                html_escape::encode_text(id)
            )),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use qitos::{RunStatus, TraceEvent, TraceStep, TraceWriter};
    use tower::ServiceExt as _;

    async fn call_router(app: Router, uri: &str) -> axum::response::Response {
        app.oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response")
    }

    fn seeded_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let mut writer = TraceWriter::create(root.path(), "run-1").unwrap();
        writer
            .write_event(&TraceEvent::new("run-1", 0, "INIT"))
            .unwrap();
        writer.write_step(&TraceStep::new(0)).unwrap();
        writer
            .finalize(
                RunStatus::Completed,
                serde_json::json!({"stop_reason": "final", "final_result": "42", "steps": 1}),
            )
            .unwrap();
        root
    }

    /// **Scenario**: the runs API lists seeded runs; the run API returns
    /// the payload and 404s on unknown ids.
    #[tokio::test]
    async fn api_routes() {
        let root = seeded_root();
        let app = build_router(root.path().to_path_buf());

        let response = call_router(app.clone(), "/api/runs").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let runs: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(runs["runs"][0]["id"], "run-1");

        let response = call_router(app.clone(), "/api/run/run-1").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call_router(app, "/api/run/ghost").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// **Scenario**: HTML pages render for existing runs and 404 otherwise.
    #[tokio::test]
    async fn html_routes() {
        let root = seeded_root();
        let app = build_router(root.path().to_path_buf());

        let response = call_router(app.clone(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call_router(app.clone(), "/run/run-1").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call_router(app, "/replay/ghost").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
