//! Environment interface: the external side-effect surface.
//!
//! An environment exposes reset/observe/step/terminal semantics plus named
//! capability groups ("ops") that tools request through `required_ops`.
//! Concrete environments (repo, host, docker, text web) are external
//! collaborators; the engine builds one from a task's [`EnvSpec`] via a
//! factory table, and unknown type tags leave the environment unset.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::action::Action;
use crate::state::StateSchema;
use crate::task::EnvSpec;
use crate::tool::OpsHandle;

/// Environment failure. Reset failures are captured into the first
/// observation; step failures become an erroring [`EnvStepResult`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvError {
    #[error("env reset: {0}")]
    Reset(String),
    #[error("env step: {0}")]
    Step(String),
    #[error("env lifecycle: {0}")]
    Lifecycle(String),
}

/// What the environment shows the agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvObservation {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EnvObservation {
    pub fn from_data(data: Value) -> Self {
        Self {
            data,
            metadata: Map::new(),
        }
    }
}

/// Result of one environment step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvStepResult {
    pub observation: EnvObservation,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default)]
    pub info: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The step payload an environment receives after the executor ran a
/// decision's actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvAction {
    pub decision_mode: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub action_results: Vec<Value>,
}

/// Capability surface owned by one engine at a time.
#[async_trait]
pub trait Env: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0"
    }

    async fn reset(
        &self,
        task: &Value,
        workspace: Option<&Path>,
    ) -> Result<EnvObservation, EnvError>;

    async fn observe(&self, state: &StateSchema) -> Result<EnvObservation, EnvError>;

    async fn step(
        &self,
        action: &EnvAction,
        state: &StateSchema,
    ) -> Result<EnvStepResult, EnvError>;

    fn is_terminal(&self, _state: &StateSchema, last_result: Option<&EnvStepResult>) -> bool {
        last_result.map(|result| result.done).unwrap_or(false)
    }

    /// A named capability group, or `None` when this env does not provide it.
    fn ops(&self, _group: &str) -> Option<OpsHandle> {
        None
    }

    async fn setup(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EnvError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Identity payload serialized into every env view.
pub fn env_identity(env: Option<&Arc<dyn Env>>) -> Value {
    match env {
        Some(env) => json!({
            "enabled": true,
            "name": env.name(),
            "version": env.version(),
        }),
        None => json!({ "enabled": false, "name": null, "version": null }),
    }
}

/// Env type tags the engine recognizes when building from an [`EnvSpec`].
pub const RECOGNIZED_ENV_TYPES: [&str; 5] = ["repo", "host", "docker", "container", "text_web_env"];

type EnvFactory = Box<dyn Fn(&EnvSpec, Option<&Path>) -> Option<Arc<dyn Env>> + Send + Sync>;

/// Maps env type tags to constructors. Empty by default, so a task's env_spec
/// resolves to no environment unless the embedder registered a factory.
#[derive(Default)]
pub struct EnvFactoryTable {
    factories: HashMap<String, EnvFactory>,
}

impl EnvFactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, env_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&EnvSpec, Option<&Path>) -> Option<Arc<dyn Env>> + Send + Sync + 'static,
    {
        self.factories
            .insert(env_type.into().to_lowercase(), Box::new(factory));
        self
    }

    pub fn build(&self, spec: &EnvSpec, workspace: Option<&Path>) -> Option<Arc<dyn Env>> {
        let tag = spec.env_type.trim().to_lowercase();
        match self.factories.get(&tag) {
            Some(factory) => factory(spec, workspace),
            None => {
                debug!(env_type = %tag, "no env factory registered; env stays unset");
                None
            }
        }
    }
}

/// Minimal in-process environment for tests and demos: echoes steps back,
/// counts them, and can declare itself terminal after a fixed number.
pub struct InMemoryEnv {
    steps_taken: Mutex<u64>,
    done_after: Option<u64>,
    ops: HashMap<String, OpsHandle>,
}

impl Default for InMemoryEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnv {
    pub fn new() -> Self {
        Self {
            steps_taken: Mutex::new(0),
            done_after: None,
            ops: HashMap::new(),
        }
    }

    /// Declare the env terminal once `steps` steps have been taken.
    pub fn done_after(mut self, steps: u64) -> Self {
        self.done_after = Some(steps);
        self
    }

    pub fn with_ops(mut self, group: impl Into<String>, handle: OpsHandle) -> Self {
        self.ops.insert(group.into(), handle);
        self
    }

    fn count(&self) -> u64 {
        self.steps_taken.lock().map(|taken| *taken).unwrap_or(0)
    }
}

#[async_trait]
impl Env for InMemoryEnv {
    fn name(&self) -> &str {
        "memory"
    }

    fn version(&self) -> &str {
        "1"
    }

    async fn reset(
        &self,
        task: &Value,
        _workspace: Option<&Path>,
    ) -> Result<EnvObservation, EnvError> {
        if let Ok(mut taken) = self.steps_taken.lock() {
            *taken = 0;
        }
        Ok(EnvObservation::from_data(json!({ "task": task })))
    }

    async fn observe(&self, _state: &StateSchema) -> Result<EnvObservation, EnvError> {
        Ok(EnvObservation::from_data(
            json!({ "steps_taken": self.count() }),
        ))
    }

    async fn step(
        &self,
        action: &EnvAction,
        _state: &StateSchema,
    ) -> Result<EnvStepResult, EnvError> {
        let taken = {
            let mut taken = self
                .steps_taken
                .lock()
                .map_err(|_| EnvError::Step("step counter poisoned".into()))?;
            *taken += 1;
            *taken
        };
        let done = self.done_after.map(|limit| taken >= limit).unwrap_or(false);
        Ok(EnvStepResult {
            observation: EnvObservation::from_data(json!({
                "decision_mode": action.decision_mode,
                "steps_taken": taken,
            })),
            done,
            reward: None,
            info: Map::new(),
            error: None,
        })
    }

    fn ops(&self, group: &str) -> Option<OpsHandle> {
        self.ops.get(group).cloned()
    }
}
