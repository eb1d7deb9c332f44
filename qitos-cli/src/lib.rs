//! qita: trace tools for QitOS runs.
//!
//! Three subcommands over a run directory tree: `board` serves a listing of
//! discovered runs with per-run pages, `replay` serves one run focused, and
//! `export` writes a single standalone HTML file. The on-disk contract is
//! the trace layout written by `qitos::TraceWriter` (`manifest.json`,
//! `events.jsonl`, `steps.jsonl`).

pub mod board;
pub mod export;
pub mod runs;

pub use board::{build_router, serve};
pub use export::{export_run, render_run_html};
pub use runs::{discover_runs, load_run_payload, resolve_run, CliError};
