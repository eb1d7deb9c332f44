//! Model client abstraction for the engine's built-in decide path.
//!
//! When an agent's `decide` defers (returns `None`), the engine builds a chat
//! message list and calls a [`ModelClient`]; the raw text goes to the
//! configured parser. Retries and rate limiting belong to the client.
//! Timeouts and connection failures surface as recoverable model errors.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Chat role for model input messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message handed to the model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage for one model call, when the backend reports it. The engine
/// accumulates totals into `state.metrics` and the token budget gate reads
/// them at CHECK_STOP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Model output: the raw completion text plus optional usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// Model failure. Timeout and connection variants are the recoverable set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("model timeout: {0}")]
    Timeout(String),
    #[error("model connection: {0}")]
    Connection(String),
    #[error("model backend: {0}")]
    Backend(String),
}

impl From<ModelError> for RuntimeError {
    fn from(err: ModelError) -> Self {
        RuntimeError::Model(err.to_string())
    }
}

/// A language-model backend: messages in, completion text out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ModelResponse, ModelError>;
}

/// Scripted model for tests and demos: returns queued responses in order and
/// records every message list it was called with.
#[derive(Default)]
pub struct MockModel {
    responses: Mutex<Vec<ModelResponse>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockModel {
    /// Queue plain-text responses, served front to back.
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(ModelResponse::text).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue responses with explicit usage, for token-budget tests.
    pub fn scripted_with_usage<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ModelResponse>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn recorded_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ModelResponse, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| ModelError::Backend("mock model poisoned".into()))?;
        if responses.is_empty() {
            return Err(ModelError::Backend("mock model response queue empty".into()));
        }
        Ok(responses.remove(0))
    }
}
