//! The agent policy contract.
//!
//! An [`AgentModule`] owns the policy of a run: how to build state, what to
//! observe, and what to do each step. The tool registry and model client
//! live on the agent but stay opaque to its own logic — the engine pulls
//! them through the accessors for dispatch and the built-in decide path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::decision::Decision;
use crate::error::RuntimeError;
use crate::llm::ModelClient;
use crate::memory::MemoryQuery;
use crate::state::AgentState;
use crate::tool::ToolRegistry;

/// Step-based agent policy, parametrized over its state and observation
/// types.
#[async_trait]
pub trait AgentModule: Send + Sync {
    type State: AgentState;
    type Observation: Clone + Serialize + Send + Sync;

    fn name(&self) -> &str {
        "agent"
    }

    /// The registry backing this agent's actions, if it acts at all.
    fn tool_registry(&self) -> Option<Arc<ToolRegistry>> {
        None
    }

    /// The model client for the built-in LLM decide path.
    fn model(&self) -> Option<Arc<dyn ModelClient>> {
        None
    }

    /// Create the initial typed state for a run.
    fn init_state(&self, task: &str) -> Result<Self::State, RuntimeError>;

    /// Optional dynamic system prompt for the LLM decide path.
    fn build_system_prompt(&self, _state: &Self::State) -> Option<String> {
        None
    }

    /// Build this step's observation from state and the runtime env view.
    async fn observe(
        &self,
        state: &Self::State,
        env_view: &Value,
    ) -> Result<Self::Observation, RuntimeError>;

    /// Produce this step's decision. Returning `Ok(None)` defers to the
    /// engine's model + parser path.
    async fn decide(
        &self,
        state: &Self::State,
        observation: &Self::Observation,
    ) -> Result<Option<Decision>, RuntimeError>;

    /// Fold observation, decision and action results into the next state.
    async fn reduce(
        &self,
        state: Self::State,
        observation: &Self::Observation,
        decision: &Decision,
        action_results: &[Value],
    ) -> Result<Self::State, RuntimeError>;

    /// Optional extra stop condition checked after every step.
    fn should_stop(&self, _state: &Self::State) -> bool {
        false
    }

    /// The user message for the LLM decide path. Defaults to the task text.
    fn prepare(&self, state: &Self::State, _observation: &Self::Observation) -> String {
        state.base().task.clone()
    }

    /// Memory retrieval query for the env view; `None` means a recent
    /// window.
    fn build_memory_query(
        &self,
        _state: &Self::State,
        _env_view: &Value,
    ) -> Option<MemoryQuery> {
        None
    }
}
