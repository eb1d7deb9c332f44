//! Memory: append-only record store with retrieval and summarization hooks.
//!
//! The engine resets memory at run start, appends records at the
//! observe/decide/act/result boundaries, and retrieves into the env view at
//! observe time. `retrieve_messages` feeds the chat history of the built-in
//! LLM decide path.

mod window;

pub use window::WindowMemory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ChatMessage;
use crate::state::StateSchema;

/// Memory backend failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("memory storage: {0}")]
    Storage(String),
}

/// One appended record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub role: String,
    pub content: Value,
    pub step_id: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryRecord {
    pub fn new(role: impl Into<String>, content: Value, step_id: u64) -> Self {
        Self {
            role: role.into(),
            content,
            step_id,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Retrieval query. The default asks for a recent window of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub max_items: usize,
    /// Restrict to these record roles; empty means all roles.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            max_items: 8,
            roles: Vec::new(),
        }
    }
}

/// Append-only record store consumed by the engine to assemble model inputs.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn append(&self, record: MemoryRecord) -> Result<(), MemoryError>;

    async fn retrieve(
        &self,
        query: &MemoryQuery,
        state: &StateSchema,
        observation: Option<&Value>,
    ) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// Chat-shaped history for the model input. Implementations typically
    /// project their `message` records.
    async fn retrieve_messages(
        &self,
        state: &StateSchema,
        observation: Option<&Value>,
        query: &MemoryQuery,
    ) -> Result<Vec<ChatMessage>, MemoryError>;

    async fn summarize(&self, max_items: usize) -> Result<String, MemoryError>;

    /// Drop overflow records; returns how many were evicted.
    async fn evict(&self) -> Result<usize, MemoryError>;

    async fn reset(&self, run_id: &str) -> Result<(), MemoryError>;
}
