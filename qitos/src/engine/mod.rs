//! The execution kernel: a deterministic step FSM over an agent module.
//!
//! Phase order per step: `OBSERVE → DECIDE → ACT → REDUCE → CRITIC →
//! CHECK_STOP`, with `INIT` once at run start and `END` at termination.
//! Failures route through `DECIDE_ERROR`/`ACT_ERROR` + `RECOVER` and the
//! recovery policy. One engine instance is reusable: per-run state clears on
//! every `run` entry.

mod hooks;
mod states;
mod validation;

pub use hooks::{EngineHook, HookContext};
pub use states::{RuntimeBudget, RuntimeEvent, RuntimePhase, StepRecord};
pub use tokio_util::sync::CancellationToken;
pub use validation::{StateValidationGate, Validator};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::action::ActionResult;
use crate::agent::AgentModule;
use crate::critic::{Critic, CriticAction};
use crate::decision::Decision;
use crate::env::{env_identity, Env, EnvAction, EnvFactoryTable, EnvObservation, EnvStepResult};
use crate::error::{classify, RuntimeError, StopReason};
use crate::executor::ActionExecutor;
use crate::llm::ChatMessage;
use crate::memory::{Memory, MemoryQuery, MemoryRecord};
use crate::parser::Parser;
use crate::recovery::RecoveryPolicy;
use crate::search::{BranchSelector, FirstCandidateSelector, Search};
use crate::state::{diff_values, AgentState};
use crate::stop::{
    FinalResultCriteria, MaxRuntimeCriteria, MaxStepsCriteria, StopContext, StopCriteria, StopHit,
};
use crate::task::Task;
use crate::trace::{RunStatus, TraceEvent, TraceWriter};

/// A task handed to [`Engine::run`]: a bare objective or a full [`Task`].
pub enum TaskInput {
    Objective(String),
    Task(Box<Task>),
}

impl From<&str> for TaskInput {
    fn from(objective: &str) -> Self {
        TaskInput::Objective(objective.to_string())
    }
}

impl From<String> for TaskInput {
    fn from(objective: String) -> Self {
        TaskInput::Objective(objective)
    }
}

impl From<Task> for TaskInput {
    fn from(task: Task) -> Self {
        TaskInput::Task(Box::new(task))
    }
}

/// Everything a finished run produced.
pub struct EngineResult<S> {
    pub state: S,
    pub records: Vec<StepRecord>,
    pub events: Vec<RuntimeEvent>,
    pub step_count: usize,
}

impl<S> EngineResult<S> {
    pub fn final_result(&self) -> Option<&str>
    where
        S: AgentState,
    {
        self.state.base().final_result.as_deref()
    }
}

const MAX_BRANCH_DEPTH: usize = 16;

/// Callback invoked on every classified phase failure, before the recovery
/// policy arbitrates.
pub type RecoveryHandler =
    Box<dyn Fn(&crate::state::StateSchema, RuntimePhase, &RuntimeError) + Send + Sync>;

/// Single execution kernel for agent-module workflows.
pub struct Engine<A: AgentModule> {
    agent: A,
    budget: RuntimeBudget,
    base_budget: RuntimeBudget,
    validation_gate: StateValidationGate,
    recovery_policy: RecoveryPolicy,
    recovery_handler: Option<RecoveryHandler>,
    cancellation: Option<CancellationToken>,
    trace_writer: Option<TraceWriter>,
    memory: Option<Arc<dyn Memory>>,
    parser: Option<Arc<dyn Parser>>,
    stop_criteria: Vec<Box<dyn StopCriteria>>,
    uses_default_stop_criteria: bool,
    branch_selector: Box<dyn BranchSelector>,
    search: Option<Box<dyn Search>>,
    critics: Vec<Box<dyn Critic>>,
    env: Option<Arc<dyn Env>>,
    env_factories: EnvFactoryTable,
    hooks: Vec<Box<dyn EngineHook<A::State>>>,
    workspace: Option<PathBuf>,
    executor: Option<ActionExecutor>,

    // Per-run state, cleared on every run() entry.
    run_id: String,
    events: Vec<RuntimeEvent>,
    records: Vec<StepRecord>,
    last_env_observation: Option<EnvObservation>,
    last_env_result: Option<EnvStepResult>,
}

impl<A: AgentModule> Engine<A> {
    pub fn new(agent: A) -> Self {
        let budget = RuntimeBudget::default();
        let mut engine = Self {
            agent,
            budget,
            base_budget: budget,
            validation_gate: StateValidationGate::default(),
            recovery_policy: RecoveryPolicy::default(),
            recovery_handler: None,
            cancellation: None,
            trace_writer: None,
            memory: None,
            parser: None,
            stop_criteria: Vec::new(),
            uses_default_stop_criteria: true,
            branch_selector: Box::new(FirstCandidateSelector),
            search: None,
            critics: Vec::new(),
            env: None,
            env_factories: EnvFactoryTable::new(),
            hooks: Vec::new(),
            workspace: None,
            executor: None,
            run_id: String::new(),
            events: Vec::new(),
            records: Vec::new(),
            last_env_observation: None,
            last_env_result: None,
        };
        engine.rebuild_default_stop_criteria();
        engine
    }

    pub fn with_budget(mut self, budget: RuntimeBudget) -> Self {
        self.budget = budget;
        self.base_budget = budget;
        if self.uses_default_stop_criteria {
            self.rebuild_default_stop_criteria();
        }
        self
    }

    pub fn with_validation_gate(mut self, gate: StateValidationGate) -> Self {
        self.validation_gate = gate;
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    pub fn with_recovery_handler(mut self, handler: RecoveryHandler) -> Self {
        self.recovery_handler = Some(handler);
        self
    }

    /// External cancellation: once the token fires, the run aborts at the
    /// next phase boundary with `unrecoverable_error`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_trace_writer(mut self, writer: TraceWriter) -> Self {
        self.trace_writer = Some(writer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Replace the synthesized default criteria with an explicit ordered
    /// list.
    pub fn with_stop_criteria(mut self, criteria: Vec<Box<dyn StopCriteria>>) -> Self {
        self.stop_criteria = criteria;
        self.uses_default_stop_criteria = false;
        self
    }

    pub fn with_branch_selector(mut self, selector: Box<dyn BranchSelector>) -> Self {
        self.branch_selector = selector;
        self
    }

    pub fn with_search(mut self, search: Box<dyn Search>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_critic(mut self, critic: Box<dyn Critic>) -> Self {
        self.critics.push(critic);
        self
    }

    pub fn with_env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_env_factories(mut self, factories: EnvFactoryTable) -> Self {
        self.env_factories = factories;
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn EngineHook<A::State>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn register_hook(&mut self, hook: Box<dyn EngineHook<A::State>>) {
        self.hooks.push(hook);
    }

    pub fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn env(&self) -> Option<&Arc<dyn Env>> {
        self.env.as_ref()
    }

    /// Drive the agent until a stop reason is reached.
    pub async fn run(
        &mut self,
        task: impl Into<TaskInput>,
    ) -> Result<EngineResult<A::State>, RuntimeError> {
        let (task_obj, task_text) = match task.into() {
            TaskInput::Objective(objective) => (None, objective),
            TaskInput::Task(task) => {
                let text = task.objective.clone();
                (Some(*task), text)
            }
        };

        self.apply_task_budget(task_obj.as_ref());
        self.events.clear();
        self.records.clear();
        self.recovery_policy.reset();
        self.last_env_observation = None;
        self.last_env_result = None;
        self.run_id = self
            .trace_writer
            .as_ref()
            .map(|writer| writer.run_id().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(memory) = &self.memory {
            if let Err(err) = memory.reset(&self.run_id).await {
                warn!(error = %err, "memory reset failed");
            }
        }

        let mut state = self.agent.init_state(&task_text)?;
        let started_at = Instant::now();
        self.executor = self.agent.tool_registry().map(ActionExecutor::new);

        let lifecycle_context = lifecycle_context(&task_text);
        self.setup_toolsets(&lifecycle_context).await;
        self.setup_env(task_obj.as_ref(), &task_text).await;

        self.emit(
            &state,
            0,
            RuntimePhase::Init,
            true,
            json!({
                "task": &task_text,
                "task_id": task_obj.as_ref().map(|t| t.id.clone()),
                "env": env_identity(self.env.as_ref()),
            }),
            None,
        );
        self.dispatch(|hook| hook.on_run_start(&task_text, &state));

        let validation_ok = self.validate_task_resources(task_obj.as_ref(), &mut state);
        if validation_ok {
            self.run_steps(&mut state, &task_obj, &task_text, started_at)
                .await;
        }

        self.teardown_env().await;
        self.teardown_toolsets(&lifecycle_context).await;
        self.finalize_trace(&state);

        let records = std::mem::take(&mut self.records);
        let events = std::mem::take(&mut self.events);
        let step_count = records.len();
        let result = EngineResult {
            state,
            records,
            events,
            step_count,
        };
        self.dispatch(|hook| hook.on_run_end(&result));
        Ok(result)
    }

    async fn run_steps(
        &mut self,
        state: &mut A::State,
        task_obj: &Option<Task>,
        task_text: &str,
        started_at: Instant,
    ) {
        let mut step_id: u64 = 0;
        loop {
            if self.cancelled(state) {
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    false,
                    json!({ "stop_reason": stop_reason_str(state), "cancelled": true }),
                    None,
                );
                break;
            }

            if self.budget_exhausted(step_id, started_at, state) {
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    false,
                    json!({ "stop_reason": stop_reason_str(state) }),
                    None,
                );
                break;
            }

            if let Err(err) = self.validation_gate.check(state.base()) {
                let failure = RuntimeError::State(err.to_string());
                self.recover(state, RuntimePhase::Observe, step_id, &failure);
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    false,
                    json!({ "stop_reason": stop_reason_str(state) }),
                    None,
                );
                break;
            }

            let mut record = StepRecord::new(step_id);
            let env_view = self.build_env_view(state, task_obj, task_text, step_id, started_at).await;

            self.dispatch(|hook| {
                hook.on_before_step(&HookContext {
                    task: task_text,
                    step_id,
                    phase: RuntimePhase::Observe,
                    state,
                    env_view: Some(&env_view),
                    observation: None,
                    decision: None,
                    action_results: &[],
                    stop_reason: None,
                    error: None,
                })
            });

            let phase_failure = self
                .run_phases(state, &env_view, &mut record, task_text)
                .await;

            if self.cancelled(state) {
                self.finalize_step(&record, state);
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    false,
                    json!({ "stop_reason": stop_reason_str(state), "cancelled": true }),
                    None,
                );
                break;
            }

            if let Some((phase, err)) = phase_failure {
                let continue_run = self.recover(state, phase, step_id, &err);
                self.finalize_step(&record, state);
                self.dispatch(|hook| {
                    hook.on_after_step(&HookContext {
                        task: task_text,
                        step_id,
                        phase: RuntimePhase::Recover,
                        state,
                        env_view: None,
                        observation: None,
                        decision: None,
                        action_results: &[],
                        stop_reason: state.base().stop_reason,
                        error: Some(err.message()),
                    })
                });
                if !continue_run {
                    self.emit(
                        state,
                        step_id,
                        RuntimePhase::End,
                        false,
                        json!({ "stop_reason": stop_reason_str(state) }),
                        None,
                    );
                    break;
                }
                if self.advance_or_stop(state, step_id) {
                    break;
                }
                step_id += 1;
                continue;
            }

            let critic_verdict = self.apply_critics(state, &mut record, task_text);
            match critic_verdict {
                CriticAction::Stop => {
                    state
                        .base_mut()
                        .set_stop(StopReason::CriticStop, None);
                    self.finalize_step(&record, state);
                    self.emit(
                        state,
                        step_id,
                        RuntimePhase::End,
                        true,
                        json!({ "stop_reason": stop_reason_str(state) }),
                        None,
                    );
                    break;
                }
                CriticAction::Retry => {
                    self.finalize_step(&record, state);
                    if self.advance_or_stop(state, step_id) {
                        break;
                    }
                    step_id += 1;
                    continue;
                }
                CriticAction::Continue => {}
            }

            let decision = record.decision.clone().unwrap_or_else(Decision::wait);
            let stop = self.run_check_stop(state, &decision, step_id, started_at, task_text);

            if let Err(err) = self.validation_gate.check(state.base()) {
                let failure = RuntimeError::State(err.to_string());
                self.recover(state, RuntimePhase::CheckStop, step_id, &failure);
                self.finalize_step(&record, state);
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    false,
                    json!({ "stop_reason": stop_reason_str(state) }),
                    None,
                );
                break;
            }

            self.finalize_step(&record, state);
            self.dispatch(|hook| {
                hook.on_after_step(&HookContext {
                    task: task_text,
                    step_id,
                    phase: RuntimePhase::CheckStop,
                    state,
                    env_view: None,
                    observation: None,
                    decision: Some(&decision),
                    action_results: &[],
                    stop_reason: state.base().stop_reason,
                    error: None,
                })
            });

            if stop {
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::End,
                    true,
                    json!({ "stop_reason": stop_reason_str(state) }),
                    None,
                );
                break;
            }

            if self.advance_or_stop(state, step_id) {
                break;
            }
            step_id += 1;
        }
    }

    /// OBSERVE → DECIDE → ACT → REDUCE; the first failing phase aborts the
    /// chain and is reported with its phase tag.
    async fn run_phases(
        &mut self,
        state: &mut A::State,
        env_view: &Value,
        record: &mut StepRecord,
        task_text: &str,
    ) -> Option<(RuntimePhase, RuntimeError)> {
        let observation = match self.run_observe(state, env_view, record, task_text).await {
            Ok(observation) => observation,
            Err(err) => return Some((RuntimePhase::Observe, err)),
        };
        let decision = match self
            .run_decide(state, &observation, record, task_text)
            .await
        {
            Ok(decision) => decision,
            Err(err) => return Some((RuntimePhase::Decide, err)),
        };
        let action_results = match self.run_act(state, &decision, record, task_text).await {
            Ok(results) => results,
            Err(err) => return Some((RuntimePhase::Act, err)),
        };
        if let Err(err) = self
            .run_reduce(state, &observation, &decision, &action_results, record, task_text)
            .await
        {
            return Some((RuntimePhase::Reduce, err));
        }
        None
    }

    async fn run_observe(
        &mut self,
        state: &A::State,
        env_view: &Value,
        record: &mut StepRecord,
        task_text: &str,
    ) -> Result<A::Observation, RuntimeError> {
        let step_id = record.step_id;
        self.dispatch(|hook| {
            hook.on_before_observe(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Observe,
                state,
                env_view: Some(env_view),
                observation: None,
                decision: None,
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::Observe,
            true,
            json!({"stage": "start"}),
            None,
        );

        let observation = self.agent.observe(state, env_view).await?;
        let observation_value = serde_json::to_value(&observation).unwrap_or(Value::Null);
        record.observation = observation_value.clone();
        self.memory_append("observation", observation_value.clone(), step_id, None)
            .await;
        self.emit(
            state,
            step_id,
            RuntimePhase::Observe,
            true,
            json!({
                "stage": "observation_ready",
                "observation": &observation_value,
                "memory": env_view.get("memory").cloned().unwrap_or_default(),
                "env": env_view.get("env").cloned().unwrap_or_default(),
            }),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_observe(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Observe,
                state,
                env_view: Some(env_view),
                observation: Some(&observation_value),
                decision: None,
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        Ok(observation)
    }

    async fn run_decide(
        &mut self,
        state: &mut A::State,
        observation: &A::Observation,
        record: &mut StepRecord,
        task_text: &str,
    ) -> Result<Decision, RuntimeError> {
        let step_id = record.step_id;
        let observation_value = record.observation.clone();
        self.dispatch(|hook| {
            hook.on_before_decide(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Decide,
                state,
                env_view: None,
                observation: Some(&observation_value),
                decision: None,
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::Decide,
            true,
            json!({"stage": "start"}),
            None,
        );

        let mut decision = match self.agent.decide(state, observation).await? {
            Some(decision) => decision,
            None => self.decide_via_model(state, observation, step_id).await?,
        };

        if decision.is_branch() {
            decision = self.select_branch(state, &observation_value, decision)?;
        }
        decision
            .validate()
            .map_err(|err| RuntimeError::Parse(err.to_string()))?;

        record.decision = Some(decision.clone());
        record.actions = decision.actions().to_vec();
        self.memory_append(
            "decision",
            serde_json::to_value(&decision).unwrap_or(Value::Null),
            step_id,
            None,
        )
        .await;
        self.emit(
            state,
            step_id,
            RuntimePhase::Decide,
            true,
            json!({
                "stage": "decision_ready",
                "mode": decision.mode(),
                "rationale": decision.rationale(),
                "actions": decision.actions(),
                "final_answer": decision.final_text(),
                "candidate_count": decision.candidates().len(),
            }),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_decide(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Decide,
                state,
                env_view: None,
                observation: Some(&observation_value),
                decision: Some(&decision),
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        Ok(decision)
    }

    /// The built-in decide path: system prompt + memory history + prepared
    /// user message through the model client, raw output through the parser.
    async fn decide_via_model(
        &mut self,
        state: &mut A::State,
        observation: &A::Observation,
        step_id: u64,
    ) -> Result<Decision, RuntimeError> {
        let Some(model) = self.agent.model() else {
            return Err(RuntimeError::System(
                "agent.decide deferred but no model client is configured".into(),
            ));
        };
        let Some(parser) = self.parser.clone() else {
            return Err(RuntimeError::System(
                "agent.decide deferred but no parser is configured".into(),
            ));
        };

        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(system_prompt) = self.agent.build_system_prompt(state) {
            if !system_prompt.trim().is_empty() {
                messages.push(ChatMessage::system(system_prompt));
            }
        }
        let mut history: Vec<ChatMessage> = Vec::new();
        if let Some(memory) = &self.memory {
            let observation_value = serde_json::to_value(observation).unwrap_or(Value::Null);
            match memory
                .retrieve_messages(state.base(), Some(&observation_value), &MemoryQuery::default())
                .await
            {
                Ok(retrieved) => history = retrieved,
                Err(err) => warn!(error = %err, "memory history retrieval failed"),
            }
        }
        let prepared = self.agent.prepare(state, observation);
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(prepared.clone()));

        self.emit(
            state,
            step_id,
            RuntimePhase::Decide,
            true,
            json!({
                "stage": "model_input",
                "prepared": &prepared,
                "history_message_count": history.len(),
                "messages": &messages,
            }),
            None,
        );
        self.memory_append(
            "message",
            json!({"role": "user", "content": prepared}),
            step_id,
            Some(engine_source_metadata()),
        )
        .await;
        self.memory_append("model_input", json!({ "messages": &messages }), step_id, None)
            .await;

        let response = model
            .complete(&messages)
            .await
            .map_err(RuntimeError::from)?;
        self.accumulate_usage(state, &response);

        self.emit(
            state,
            step_id,
            RuntimePhase::Decide,
            true,
            json!({"stage": "model_output", "raw_output": &response.content}),
            None,
        );
        self.memory_append(
            "message",
            json!({"role": "assistant", "content": response.content.clone()}),
            step_id,
            Some(engine_source_metadata()),
        )
        .await;
        self.memory_append("model_output", json!(response.content.clone()), step_id, None)
            .await;

        let mut context = Map::new();
        context.insert("step".into(), json!(step_id));
        parser
            .parse(&response.content, Some(&context))
            .map_err(RuntimeError::from)
    }

    fn accumulate_usage(&self, state: &mut A::State, response: &crate::llm::ModelResponse) {
        let Some(usage) = response.usage else {
            return;
        };
        let metrics = &mut state.base_mut().metrics;
        for (key, amount) in [
            ("tokens_prompt", usage.prompt_tokens),
            ("tokens_completion", usage.completion_tokens),
            ("tokens_total", usage.total_tokens),
        ] {
            let current = metrics.get(key).and_then(Value::as_u64).unwrap_or(0);
            metrics.insert(key.into(), json!(current + amount));
        }
    }

    /// Resolve a branch decision into an executable one, recursing while the
    /// winner is itself a branch.
    fn select_branch(
        &mut self,
        state: &mut A::State,
        observation: &Value,
        mut decision: Decision,
    ) -> Result<Decision, RuntimeError> {
        for _ in 0..MAX_BRANCH_DEPTH {
            if !decision.is_branch() {
                return Ok(decision);
            }
            decision = match &mut self.search {
                Some(search) => {
                    let mut candidates = search.expand(state.base(), observation, &decision);
                    if candidates.is_empty() {
                        candidates = decision.candidates().to_vec();
                    }
                    let scores = search.score(state.base(), observation, &candidates);
                    let kept = search.prune(candidates, &scores);
                    if kept.is_empty() {
                        search.backtrack(state.base_mut());
                        return Ok(Decision::wait().with_rationale("search backtrack"));
                    }
                    let scores = search.score(state.base(), observation, &kept);
                    let selected = search.select(&kept, &scores).ok_or_else(|| {
                        RuntimeError::System("search selected no candidate".into())
                    })?;
                    search.mark_selected(state.base_mut(), &selected);
                    selected
                }
                None => self
                    .branch_selector
                    .select(decision.candidates(), state.base(), observation)?,
            };
            decision
                .validate()
                .map_err(|err| RuntimeError::Parse(err.to_string()))?;
        }
        Err(RuntimeError::System(format!(
            "branch resolution exceeded depth {MAX_BRANCH_DEPTH}"
        )))
    }

    async fn run_act(
        &mut self,
        state: &mut A::State,
        decision: &Decision,
        record: &mut StepRecord,
        task_text: &str,
    ) -> Result<Vec<Value>, RuntimeError> {
        let step_id = record.step_id;
        self.dispatch(|hook| {
            hook.on_before_act(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Act,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::Act,
            true,
            json!({"stage": "start"}),
            None,
        );

        if decision.actions().is_empty() {
            self.emit(
                state,
                step_id,
                RuntimePhase::Act,
                true,
                json!({"stage": "skipped", "reason": "decision_not_act"}),
                None,
            );
            return Ok(Vec::new());
        }
        let Some(executor) = &self.executor else {
            return Err(RuntimeError::System(
                "no tool registry configured for action execution".into(),
            ));
        };

        let execution = executor
            .execute(decision.actions(), self.env.as_ref(), state.base())
            .await;
        record.tool_invocations = execution.iter().map(tool_invocation).collect();
        let mut results: Vec<Value> = execution.iter().map(ActionResult::payload).collect();

        if self.env.is_some() {
            if let Some(env_result) = self.run_env_step(state, decision, &results).await {
                results.push(json!({ "env": env_step_result_value(&env_result) }));
            }
        }
        record.action_results = results.clone();
        for item in &results {
            self.memory_append("action_result", item.clone(), step_id, None)
                .await;
        }

        self.emit(
            state,
            step_id,
            RuntimePhase::Act,
            true,
            json!({
                "stage": "action_results",
                "tool_invocations": &record.tool_invocations,
                "action_results": &results,
            }),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_act(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Act,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results: &results,
                stop_reason: None,
                error: None,
            })
        });
        Ok(results)
    }

    async fn run_env_step(
        &mut self,
        state: &A::State,
        decision: &Decision,
        action_results: &[Value],
    ) -> Option<EnvStepResult> {
        let env = self.env.clone()?;
        let step_id = state.base().current_step;
        let action = EnvAction {
            decision_mode: decision.mode().to_string(),
            actions: decision.actions().to_vec(),
            final_answer: decision.final_text().map(str::to_string),
            action_results: action_results.to_vec(),
        };
        match env.step(&action, state.base()).await {
            Ok(result) => {
                self.last_env_observation = Some(result.observation.clone());
                self.last_env_result = Some(result.clone());
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::Act,
                    true,
                    json!({"stage": "env_step", "env_result": env_step_result_value(&result)}),
                    None,
                );
                Some(result)
            }
            Err(err) => {
                let failed = EnvStepResult {
                    observation: EnvObservation::from_data(json!({"error": err.to_string()})),
                    done: false,
                    reward: None,
                    info: Map::new(),
                    error: Some(err.to_string()),
                };
                self.last_env_observation = Some(failed.observation.clone());
                self.last_env_result = Some(failed.clone());
                self.emit(
                    state,
                    step_id,
                    RuntimePhase::Act,
                    false,
                    json!({"stage": "env_step_error"}),
                    Some(err.to_string()),
                );
                Some(failed)
            }
        }
    }

    async fn run_reduce(
        &mut self,
        state: &mut A::State,
        observation: &A::Observation,
        decision: &Decision,
        action_results: &[Value],
        record: &mut StepRecord,
        task_text: &str,
    ) -> Result<(), RuntimeError> {
        let step_id = record.step_id;
        self.dispatch(|hook| {
            hook.on_before_reduce(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Reduce,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results,
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::Reduce,
            true,
            json!({"stage": "start"}),
            None,
        );

        let before = state.to_value();
        let reduced = self
            .agent
            .reduce(state.clone(), observation, decision, action_results)
            .await?;
        *state = reduced;
        let after = state.to_value();
        record.state_diff = diff_values(&before, &after);

        self.emit(
            state,
            step_id,
            RuntimePhase::Reduce,
            true,
            json!({"stage": "state_reduced", "state_diff": &record.state_diff}),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_reduce(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Reduce,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results,
                stop_reason: None,
                error: None,
            })
        });
        Ok(())
    }

    fn apply_critics(
        &mut self,
        state: &mut A::State,
        record: &mut StepRecord,
        task_text: &str,
    ) -> CriticAction {
        if self.critics.is_empty() {
            return CriticAction::Continue;
        }
        let step_id = record.step_id;
        let decision = record.decision.clone().unwrap_or_else(Decision::wait);
        self.dispatch(|hook| {
            hook.on_before_critic(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Critic,
                state,
                env_view: None,
                observation: None,
                decision: Some(&decision),
                action_results: &record.action_results,
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::Critic,
            true,
            json!({"stage": "start", "critic_count": self.critics.len()}),
            None,
        );

        // Every critic runs; the first non-continue verdict wins.
        let mut outputs = Vec::new();
        let mut verdict = CriticAction::Continue;
        for critic in &self.critics {
            let output = critic.evaluate(state.base_mut(), &decision, &record.action_results);
            if verdict == CriticAction::Continue && output.action != CriticAction::Continue {
                verdict = output.action;
            }
            outputs.push(serde_json::to_value(&output).unwrap_or(Value::Null));
        }
        record.critic_outputs = outputs.clone();
        let stage = match verdict {
            CriticAction::Continue => "pass",
            CriticAction::Retry => "retry",
            CriticAction::Stop => "stop",
        };
        self.emit(
            state,
            step_id,
            RuntimePhase::Critic,
            true,
            json!({"stage": stage, "critic_outputs": outputs}),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_critic(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::Critic,
                state,
                env_view: None,
                observation: None,
                decision: Some(&decision),
                action_results: &record.action_results,
                stop_reason: None,
                error: None,
            })
        });
        verdict
    }

    fn run_check_stop(
        &mut self,
        state: &mut A::State,
        decision: &Decision,
        step_id: u64,
        started_at: Instant,
        task_text: &str,
    ) -> bool {
        self.dispatch(|hook| {
            hook.on_before_check_stop(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::CheckStop,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results: &[],
                stop_reason: None,
                error: None,
            })
        });
        self.emit(
            state,
            step_id,
            RuntimePhase::CheckStop,
            true,
            json!({"stage": "start"}),
            None,
        );

        let mut stopped = false;
        if let Some(answer) = decision.final_text() {
            state
                .base_mut()
                .set_stop(StopReason::Final, Some(answer.to_string()));
            stopped = true;
        } else if self.agent.should_stop(state) {
            if state.base().stop_reason.is_none() {
                state.base_mut().set_stop(StopReason::AgentCondition, None);
            }
            stopped = true;
        } else if self.env_terminal(state) {
            if state.base().stop_reason.is_none() {
                state.base_mut().set_stop(StopReason::EnvTerminal, None);
            }
            stopped = true;
        } else {
            let runtime = StopContext {
                elapsed_seconds: started_at.elapsed().as_secs_f64(),
                tokens_total: tokens_total(state.base()),
            };
            if let Some(StopHit { reason, detail }) = self.check_criteria(state, step_id, &runtime)
            {
                if state.base().stop_reason.is_none() {
                    state.base_mut().set_stop(reason, None);
                }
                debug!(reason = %reason, detail = %detail, "stop criteria hit");
                stopped = true;
            }
        }

        let stage = if stopped { "stop" } else { "continue" };
        self.emit(
            state,
            step_id,
            RuntimePhase::CheckStop,
            true,
            json!({
                "stage": stage,
                "stop_reason": stop_reason_str(state),
                "final_result": &state.base().final_result,
            }),
            None,
        );
        self.dispatch(|hook| {
            hook.on_after_check_stop(&HookContext {
                task: task_text,
                step_id,
                phase: RuntimePhase::CheckStop,
                state,
                env_view: None,
                observation: None,
                decision: Some(decision),
                action_results: &[],
                stop_reason: state.base().stop_reason,
                error: None,
            })
        });
        stopped
    }

    /// An external cancel stops the run as unrecoverable; runtime budgets
    /// keep their own stop reason via the budget gate.
    fn cancelled(&self, state: &mut A::State) -> bool {
        let cancelled = self
            .cancellation
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false);
        if cancelled && state.base().stop_reason.is_none() {
            state
                .base_mut()
                .set_stop(StopReason::UnrecoverableError, None);
        }
        cancelled
    }

    fn env_terminal(&self, state: &A::State) -> bool {
        match &self.env {
            Some(env) => env.is_terminal(state.base(), self.last_env_result.as_ref()),
            None => false,
        }
    }

    fn check_criteria(
        &mut self,
        state: &A::State,
        step_id: u64,
        runtime: &StopContext,
    ) -> Option<StopHit> {
        for criteria in &mut self.stop_criteria {
            if let Some(hit) = criteria.should_stop(state.base(), step_id, runtime) {
                return Some(hit);
            }
        }
        None
    }

    /// Budget gate checked before every step.
    fn budget_exhausted(&self, step_id: u64, started_at: Instant, state: &mut A::State) -> bool {
        if step_id >= self.budget.max_steps {
            state.base_mut().set_stop(StopReason::BudgetSteps, None);
            return true;
        }
        if let Some(max_runtime) = self.budget.max_runtime_seconds {
            if started_at.elapsed().as_secs_f64() > max_runtime {
                state.base_mut().set_stop(StopReason::BudgetTime, None);
                return true;
            }
        }
        if let Some(max_tokens) = self.budget.max_tokens {
            if tokens_total(state.base()) > max_tokens {
                state.base_mut().set_stop(StopReason::BudgetTokens, None);
                return true;
            }
        }
        false
    }

    /// Route a phase failure through the recovery policy. Returns whether
    /// the run continues.
    fn recover(
        &mut self,
        state: &mut A::State,
        phase: RuntimePhase,
        step_id: u64,
        err: &RuntimeError,
    ) -> bool {
        self.dispatch(|hook| {
            hook.on_recover(&HookContext {
                task: "",
                step_id,
                phase,
                state,
                env_view: None,
                observation: None,
                decision: None,
                action_results: &[],
                stop_reason: state.base().stop_reason,
                error: Some(err.message()),
            })
        });
        match phase {
            RuntimePhase::Decide => self.emit(
                state,
                step_id,
                RuntimePhase::DecideError,
                false,
                Value::Object(Map::new()),
                Some(err.to_string()),
            ),
            RuntimePhase::Act => self.emit(
                state,
                step_id,
                RuntimePhase::ActError,
                false,
                Value::Object(Map::new()),
                Some(err.to_string()),
            ),
            _ => {}
        }
        self.emit(
            state,
            step_id,
            RuntimePhase::Recover,
            false,
            Value::Object(Map::new()),
            Some(err.to_string()),
        );

        if let Some(handler) = &self.recovery_handler {
            handler(state.base(), phase, err);
        }

        let info = classify(err, phase.as_str(), step_id);
        let decision = self.recovery_policy.handle(&info);
        if let Some(reason) = decision.stop_reason {
            state.base_mut().set_stop(reason, None);
        }
        if !decision.continue_run && state.base().stop_reason.is_none() {
            state
                .base_mut()
                .set_stop(StopReason::UnrecoverableError, None);
        }
        decision.continue_run
    }

    /// Advance the step counter; a failed advance stops the run.
    fn advance_or_stop(&mut self, state: &mut A::State, step_id: u64) -> bool {
        if let Err(err) = state.base_mut().advance_step() {
            let failure = RuntimeError::State(err.to_string());
            self.recover(state, RuntimePhase::CheckStop, step_id, &failure);
            self.emit(
                state,
                step_id,
                RuntimePhase::End,
                false,
                json!({ "stop_reason": stop_reason_str(state) }),
                None,
            );
            return true;
        }
        false
    }

    fn validate_task_resources(&mut self, task_obj: Option<&Task>, state: &mut A::State) -> bool {
        let Some(task) = task_obj else {
            return true;
        };
        let issues = task.validate_resources(self.workspace.as_deref());
        if !issues.iter().any(|issue| issue.required) {
            return true;
        }
        state
            .base_mut()
            .set_stop(StopReason::TaskValidationFailed, None);
        self.emit(
            state,
            0,
            RuntimePhase::End,
            false,
            json!({
                "stop_reason": stop_reason_str(state),
                "issues": issues,
            }),
            None,
        );
        false
    }

    async fn build_env_view(
        &mut self,
        state: &A::State,
        task_obj: &Option<Task>,
        task_text: &str,
        step_id: u64,
        started_at: Instant,
    ) -> Value {
        let elapsed = started_at.elapsed().as_secs_f64();
        let memory_context = self.build_memory_context(state, step_id, elapsed).await;
        json!({
            "step_id": step_id,
            "elapsed_seconds": elapsed,
            "budget": self.budget,
            "metadata": &state.base().metadata,
            "memory": memory_context,
            "env": self.env_payload(),
            "task": match task_obj {
                Some(task) => task.to_value(),
                None => json!({ "objective": task_text }),
            },
        })
    }

    async fn build_memory_context(
        &self,
        state: &A::State,
        step_id: u64,
        elapsed_seconds: f64,
    ) -> Value {
        let Some(memory) = &self.memory else {
            return json!({"enabled": false, "records": [], "summary": ""});
        };
        let probe_view = json!({
            "step_id": step_id,
            "elapsed_seconds": elapsed_seconds,
            "metadata": &state.base().metadata,
        });
        let query = self
            .agent
            .build_memory_query(state, &probe_view)
            .unwrap_or_default();
        let records = match memory.retrieve(&query, state.base(), None).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "memory retrieval failed");
                Vec::new()
            }
        };
        let summary = match memory.summarize(query.max_items.max(1)).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "memory summarize failed");
                String::new()
            }
        };
        json!({
            "enabled": true,
            "query": query,
            "records": records,
            "summary": summary,
        })
    }

    fn env_payload(&self) -> Value {
        match &self.env {
            None => json!({"enabled": false}),
            Some(env) => json!({
                "enabled": true,
                "name": env.name(),
                "version": env.version(),
                "observation": &self.last_env_observation,
                "last_result": self.last_env_result.as_ref().map(env_step_result_value),
            }),
        }
    }

    async fn setup_env(&mut self, task_obj: Option<&Task>, task_text: &str) {
        if self.env.is_none() {
            if let Some(spec) = task_obj.and_then(|task| task.env_spec.as_ref()) {
                self.env = self.env_factories.build(spec, self.workspace.as_deref());
            }
        }
        let Some(env) = self.env.clone() else {
            return;
        };
        let reset_task = match task_obj {
            Some(task) => task.to_value(),
            None => json!(task_text),
        };
        match env.reset(&reset_task, self.workspace.as_deref()).await {
            Ok(observation) => {
                self.last_env_result = Some(EnvStepResult {
                    observation: observation.clone(),
                    done: false,
                    reward: None,
                    info: {
                        let mut info = Map::new();
                        info.insert("source".into(), json!("reset"));
                        info
                    },
                    error: None,
                });
                self.last_env_observation = Some(observation);
            }
            Err(err) => {
                warn!(error = %err, "env reset failed");
                let observation = EnvObservation::from_data(json!({"error": err.to_string()}));
                self.last_env_result = Some(EnvStepResult {
                    observation: observation.clone(),
                    done: false,
                    reward: None,
                    info: Map::new(),
                    error: Some(err.to_string()),
                });
                self.last_env_observation = Some(observation);
            }
        }
    }

    async fn teardown_env(&mut self) {
        if let Some(env) = &self.env {
            if let Err(err) = env.close().await {
                warn!(error = %err, "env close failed");
            }
        }
    }

    async fn setup_toolsets(&mut self, context: &Map<String, Value>) {
        let Some(registry) = self.agent.tool_registry() else {
            return;
        };
        self.write_lifecycle_event("toolset_setup_start", context, true, None);
        match registry.setup(context).await {
            Ok(()) => self.write_lifecycle_event("toolset_setup_end", context, true, None),
            Err(err) => self.write_lifecycle_event(
                "toolset_setup_error",
                context,
                false,
                Some(err.to_string()),
            ),
        }
    }

    async fn teardown_toolsets(&mut self, context: &Map<String, Value>) {
        let Some(registry) = self.agent.tool_registry() else {
            return;
        };
        self.write_lifecycle_event("toolset_teardown_start", context, true, None);
        let failures = registry.teardown(context).await;
        if failures.is_empty() {
            self.write_lifecycle_event("toolset_teardown_end", context, true, None);
        } else {
            for (toolset, err) in failures {
                self.write_lifecycle_event(
                    "toolset_teardown_error",
                    context,
                    false,
                    Some(format!("{toolset}: {err}")),
                );
            }
        }
    }

    fn write_lifecycle_event(
        &mut self,
        phase: &str,
        payload: &Map<String, Value>,
        ok: bool,
        error: Option<String>,
    ) {
        let Some(writer) = &mut self.trace_writer else {
            return;
        };
        let mut event =
            TraceEvent::new(writer.run_id(), 0, phase).with_payload(Value::Object(payload.clone()));
        event.ok = ok;
        event.error = error;
        if let Err(err) = writer.write_event(&event) {
            warn!(error = %err, "lifecycle trace write failed");
        }
    }

    fn finalize_step(&mut self, record: &StepRecord, state: &A::State) {
        if let Some(writer) = &mut self.trace_writer {
            if let Err(err) = writer.write_step(&record.to_trace()) {
                warn!(error = %err, "trace step write failed");
            }
        }
        let record_ref = record;
        self.dispatch(|hook| hook.on_step_end(record_ref, state));
        self.records.push(record.clone());
    }

    fn finalize_trace(&mut self, state: &A::State) {
        let failure_report = self
            .recovery_policy
            .failure_report(state.base().stop_reason);
        let Some(writer) = &mut self.trace_writer else {
            return;
        };
        let status = if state.base().stop_reason == Some(StopReason::UnrecoverableError) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let summary = json!({
            "stop_reason": stop_reason_str(state),
            "final_result": &state.base().final_result,
            "steps": self.records.len(),
            "failure_report": failure_report,
        });
        if let Err(err) = writer.finalize(status, summary) {
            warn!(error = %err, "trace finalize failed");
        }
    }

    fn emit(
        &mut self,
        state: &A::State,
        step_id: u64,
        phase: RuntimePhase,
        ok: bool,
        payload: Value,
        error: Option<String>,
    ) {
        let mut event = RuntimeEvent::new(step_id, phase);
        event.ok = ok;
        event.payload = payload;
        event.error = error;

        if let Some(writer) = &mut self.trace_writer {
            if let Err(err) = writer.write_event(&event.to_trace(writer.run_id())) {
                warn!(error = %err, "trace event write failed");
            }
        }
        let event_ref = &event;
        self.dispatch(|hook| hook.on_event(event_ref, state));
        self.events.push(event);
    }

    async fn memory_append(
        &self,
        role: &str,
        content: Value,
        step_id: u64,
        metadata: Option<Map<String, Value>>,
    ) {
        let Some(memory) = &self.memory else {
            return;
        };
        let mut record = MemoryRecord::new(role, content, step_id);
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata);
        }
        if let Err(err) = memory.append(record).await {
            warn!(error = %err, "memory append failed");
        }
    }

    /// Best-effort hook dispatch: a panicking hook never crashes the run.
    fn dispatch<F>(&self, call: F)
    where
        F: Fn(&dyn EngineHook<A::State>),
    {
        for hook in &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| call(hook.as_ref()))).is_err() {
                warn!("engine hook panicked; continuing");
            }
        }
    }

    fn apply_task_budget(&mut self, task_obj: Option<&Task>) {
        self.budget = self.base_budget;
        if let Some(task) = task_obj {
            if let Some(max_steps) = task.budget.max_steps {
                self.budget.max_steps = max_steps;
            }
            if let Some(max_runtime) = task.budget.max_runtime_seconds {
                self.budget.max_runtime_seconds = Some(max_runtime);
            }
            if let Some(max_tokens) = task.budget.max_tokens {
                self.budget.max_tokens = Some(max_tokens);
            }
        }
        if self.uses_default_stop_criteria {
            self.rebuild_default_stop_criteria();
        }
    }

    fn rebuild_default_stop_criteria(&mut self) {
        let mut criteria: Vec<Box<dyn StopCriteria>> =
            vec![Box::new(MaxStepsCriteria::new(self.budget.max_steps))];
        if let Some(max_runtime) = self.budget.max_runtime_seconds {
            criteria.push(Box::new(MaxRuntimeCriteria::new(max_runtime)));
        }
        criteria.push(Box::new(FinalResultCriteria));
        self.stop_criteria = criteria;
    }
}

fn lifecycle_context(task_text: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("task".into(), json!(task_text));
    context
}

fn engine_source_metadata() -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("source".into(), json!("engine"));
    metadata
}

fn stop_reason_str<S: AgentState>(state: &S) -> Option<&'static str> {
    state.base().stop_reason.map(|reason| reason.as_str())
}

fn tokens_total(state: &crate::state::StateSchema) -> u64 {
    state
        .metrics
        .get("tokens_total")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn tool_invocation(result: &ActionResult) -> Value {
    json!({
        "tool_name": result.metadata.get("tool_name").cloned().unwrap_or(json!(result.name)),
        "toolset_name": result.metadata.get("toolset_name").cloned().unwrap_or(Value::Null),
        "toolset_version": result.metadata.get("toolset_version").cloned().unwrap_or(Value::Null),
        "source": result.metadata.get("source").cloned().unwrap_or(json!("unknown")),
        "attempts": result.attempts,
        "latency_ms": result.latency_ms,
        "status": result.status.as_str(),
        "error_category": result.metadata.get("error_category").cloned().unwrap_or(Value::Null),
        "error": &result.error,
    })
}

fn env_step_result_value(result: &EnvStepResult) -> Value {
    json!({
        "observation": &result.observation,
        "done": result.done,
        "reward": result.reward,
        "info": &result.info,
        "error": &result.error,
    })
}
