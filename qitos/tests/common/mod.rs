//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use qitos::{
    Action, AgentModule, AgentState, Decision, FunctionTool, ModelClient, RuntimeError,
    StateSchema, Tool, ToolRegistry, ToolSpec, Toolset,
};

/// Test state: the schema base plus a log of action results.
#[derive(Clone, Serialize)]
pub struct DemoState {
    #[serde(flatten)]
    pub base: StateSchema,
    pub logs: Vec<String>,
}

impl DemoState {
    pub fn new(task: &str, max_steps: u64) -> Self {
        Self {
            base: StateSchema::new(task, max_steps),
            logs: Vec::new(),
        }
    }
}

impl AgentState for DemoState {
    fn base(&self) -> &StateSchema {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StateSchema {
        &mut self.base
    }
}

/// Agent driven by a queue of pre-scripted decisions. `None` entries defer
/// to the engine's model + parser path. When the queue runs dry the agent
/// waits.
pub struct ScriptedAgent {
    registry: Option<Arc<ToolRegistry>>,
    model: Option<Arc<dyn ModelClient>>,
    decisions: Mutex<VecDeque<Option<Decision>>>,
    max_steps: u64,
}

impl ScriptedAgent {
    pub fn new(decisions: Vec<Option<Decision>>) -> Self {
        Self {
            registry: None,
            model: None,
            decisions: Mutex::new(decisions.into()),
            max_steps: 10,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }
}

#[async_trait]
impl AgentModule for ScriptedAgent {
    type State = DemoState;
    type Observation = Value;

    fn name(&self) -> &str {
        "scripted"
    }

    fn tool_registry(&self) -> Option<Arc<ToolRegistry>> {
        self.registry.clone()
    }

    fn model(&self) -> Option<Arc<dyn ModelClient>> {
        self.model.clone()
    }

    fn init_state(&self, task: &str) -> Result<DemoState, RuntimeError> {
        Ok(DemoState::new(task, self.max_steps))
    }

    async fn observe(
        &self,
        state: &DemoState,
        _env_view: &Value,
    ) -> Result<Value, RuntimeError> {
        Ok(json!({ "step": state.base.current_step }))
    }

    async fn decide(
        &self,
        _state: &DemoState,
        _observation: &Value,
    ) -> Result<Option<Decision>, RuntimeError> {
        let mut decisions = self
            .decisions
            .lock()
            .map_err(|_| RuntimeError::System("decision queue poisoned".into()))?;
        Ok(decisions.pop_front().unwrap_or(Some(Decision::wait())))
    }

    async fn reduce(
        &self,
        mut state: DemoState,
        _observation: &Value,
        _decision: &Decision,
        action_results: &[Value],
    ) -> Result<DemoState, RuntimeError> {
        for result in action_results {
            state.logs.push(result.to_string());
        }
        Ok(state)
    }
}

/// Registry with a single `add(a, b)` function tool.
pub fn registry_with_add() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(add_tool()).unwrap();
    Arc::new(registry)
}

pub fn add_tool() -> Arc<dyn Tool> {
    let spec = ToolSpec::new("add", "Add two integers.")
        .with_param("a", "integer", "left operand", true)
        .with_param("b", "integer", "right operand", true);
    Arc::new(FunctionTool::new(spec, |args| {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    }))
}

/// Toolset `math` at version 1.2 exposing `add`, for provenance tests.
pub struct MathToolset;

#[async_trait]
impl Toolset for MathToolset {
    fn name(&self) -> &str {
        "math"
    }

    fn version(&self) -> &str {
        "1.2"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![add_tool()]
    }
}

pub fn math_toolset_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register_toolset(Arc::new(MathToolset), None)
        .unwrap();
    Arc::new(registry)
}

pub fn add_action(a: i64, b: i64) -> Action {
    Action::new("add")
        .with_arg("a", json!(a))
        .with_arg("b", json!(b))
}
