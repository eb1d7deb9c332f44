//! Append-only trace of a run: events, steps and a manifest.
//!
//! Exactly three files per run directory: `events.jsonl` and `steps.jsonl`
//! (newline-delimited JSON, strictly append-only, flushed per line) and
//! `manifest.json` (overwritten atomically at finalize only). A reader that
//! observes step N in `steps.jsonl` may assume every event with
//! `step_id <= N` has been flushed. [`ReplaySession`] reads the artifacts
//! back for cursor-based inspection and read-only forking.

mod events;
mod replay;
mod schema;
mod writer;

pub use events::{TraceEvent, TraceStep};
pub use replay::{
    build_inspector_payload, Breakpoint, InspectorPayload, ReplaySession, ReplaySnapshot,
};
pub use schema::TraceSchemaValidator;
pub use writer::{RunStatus, TraceWriter};

/// Trace layer failure.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("trace schema: {0}")]
    Schema(String),
    #[error("run dir not found: {0}")]
    RunDirNotFound(String),
}
