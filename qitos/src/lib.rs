//! # QitOS
//!
//! An agent runtime kernel: given a task and a language-model backend, the
//! [`Engine`] drives a deterministic step loop — ask the model (or the agent)
//! what to do, parse its output into a normalized [`Decision`], dispatch tool
//! invocations against an execution environment, fold the results back into
//! typed state, apply critics, and write an append-only trace of every phase
//! suitable for replay and inspection.
//!
//! ## Design principles
//!
//! - **One kernel, pluggable surfaces**: parsing, memory, search, critics and
//!   environments are small traits; the engine owns only phase ordering,
//!   budgets, recovery and the trace.
//! - **Typed state, state-in/state-out**: a run's state embeds
//!   [`StateSchema`] and flows through `observe → decide → act → reduce`;
//!   only `reduce` and engine-controlled terminal transitions mutate it.
//! - **Event-sourced runs**: every phase emits an event; `events.jsonl`,
//!   `steps.jsonl` and `manifest.json` reconstruct the run exactly.
//!
//! ## Main modules
//!
//! - [`engine`]: [`Engine`], [`EngineResult`], [`RuntimeBudget`],
//!   [`RuntimePhase`], hooks and the validation gate.
//! - [`agent`]: the [`AgentModule`] policy contract.
//! - [`decision`] / [`action`]: the decision and action contracts.
//! - [`state`]: [`StateSchema`], [`PlanState`], the [`AgentState`] trait and
//!   schema migrations.
//! - [`task`]: [`Task`], resources, budgets and env specs.
//! - [`tool`]: [`Tool`], [`ToolRegistry`], [`Toolset`], [`ToolContext`].
//! - [`parser`]: JSON / XML / ReAct-text decision parsers.
//! - [`memory`]: the [`Memory`] trait and [`WindowMemory`].
//! - [`env`]: the [`Env`] trait, env factories and a test env.
//! - [`executor`]: the retrying, ops-aware action executor.
//! - [`search`] / [`critic`] / [`recovery`] / [`stop`]: branch resolution,
//!   verifiers, failure arbitration and stop criteria.
//! - [`trace`]: the trace writer, schema validator and replay session.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde::Serialize;
//! use serde_json::{json, Value};
//! use qitos::{
//!     AgentModule, AgentState, Decision, Engine, RuntimeBudget, RuntimeError, StateSchema,
//! };
//!
//! #[derive(Clone, Serialize)]
//! struct CalcState {
//!     #[serde(flatten)]
//!     base: StateSchema,
//! }
//!
//! impl AgentState for CalcState {
//!     fn base(&self) -> &StateSchema {
//!         &self.base
//!     }
//!     fn base_mut(&mut self) -> &mut StateSchema {
//!         &mut self.base
//!     }
//! }
//!
//! struct CalcAgent;
//!
//! #[async_trait]
//! impl AgentModule for CalcAgent {
//!     type State = CalcState;
//!     type Observation = Value;
//!
//!     fn init_state(&self, task: &str) -> Result<CalcState, RuntimeError> {
//!         Ok(CalcState { base: StateSchema::new(task, 3) })
//!     }
//!
//!     async fn observe(&self, _state: &CalcState, _env_view: &Value) -> Result<Value, RuntimeError> {
//!         Ok(json!({}))
//!     }
//!
//!     async fn decide(&self, state: &CalcState, _obs: &Value) -> Result<Option<Decision>, RuntimeError> {
//!         if state.base.current_step == 0 {
//!             Ok(Some(Decision::wait().with_rationale("planning")))
//!         } else {
//!             Ok(Some(Decision::final_answer("42")))
//!         }
//!     }
//!
//!     async fn reduce(
//!         &self,
//!         state: CalcState,
//!         _obs: &Value,
//!         _decision: &Decision,
//!         _results: &[Value],
//!     ) -> Result<CalcState, RuntimeError> {
//!         Ok(state)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut engine = Engine::new(CalcAgent).with_budget(RuntimeBudget::with_max_steps(3));
//! let result = engine.run("compute 40+2").await.unwrap();
//! println!("{:?}", result.final_result());
//! # }
//! ```

pub mod action;
pub mod agent;
pub mod critic;
pub mod decision;
pub mod engine;
pub mod env;
pub mod error;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod parser;
pub mod plan;
pub mod recovery;
pub mod search;
pub mod state;
pub mod stop;
pub mod task;
pub mod tool;
pub mod trace;

pub use action::{Action, ActionKind, ActionResult, ActionStatus, ExecutionMode, ExecutionPolicy};
pub use agent::AgentModule;
pub use critic::{
    Critic, CriticAction, CriticOutput, PassThroughCritic, ReActSelfReflectionCritic,
    SelfReflectionCritic,
};
pub use decision::{Decision, DecisionError};
pub use engine::{
    CancellationToken, Engine, EngineHook, EngineResult, HookContext, RecoveryHandler,
    RuntimeBudget, RuntimeEvent, RuntimePhase, StateValidationGate, StepRecord, TaskInput,
};
pub use env::{
    env_identity, Env, EnvAction, EnvError, EnvFactoryTable, EnvObservation, EnvStepResult,
    InMemoryEnv, RECOGNIZED_ENV_TYPES,
};
pub use error::{classify, ErrorCategory, RuntimeError, RuntimeErrorInfo, StopReason};
pub use executor::ActionExecutor;
pub use llm::{ChatMessage, MockModel, ModelClient, ModelError, ModelResponse, Role, TokenUsage};
pub use memory::{Memory, MemoryError, MemoryQuery, MemoryRecord, WindowMemory};
pub use parser::{
    JsonDecisionParser, ParseError, Parser, ReActTextParser, XmlDecisionParser,
};
pub use plan::parse_numbered_plan;
pub use recovery::{FailureDiagnostic, RecoveryDecision, RecoveryPolicy};
pub use search::{
    BranchSelector, DynamicTreeSearch, FirstCandidateSelector, GreedySearch, Search,
};
pub use state::{
    diff_values, AgentState, PlanState, PlanStatus, StateError, StateMigrationRegistry,
    StateSchema,
};
pub use stop::{
    FinalResultCriteria, MaxRuntimeCriteria, MaxStepsCriteria, StagnationCriteria, StopContext,
    StopCriteria, StopHit,
};
pub use task::{EnvSpec, Task, TaskBudget, TaskResource, TaskValidationIssue};
pub use tool::{
    FunctionTool, OpsHandle, RegisteredTool, Tool, ToolContext, ToolError, ToolOrigin, ToolParam,
    ToolPermission, ToolRegistry, ToolSpec, Toolset,
};
pub use trace::{
    build_inspector_payload, Breakpoint, InspectorPayload, ReplaySession, ReplaySnapshot,
    RunStatus, TraceError, TraceEvent, TraceSchemaValidator, TraceStep, TraceWriter,
};
