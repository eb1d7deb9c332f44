//! Engine hooks: best-effort lifecycle callbacks.
//!
//! Hook dispatch never alters a run: a panicking hook is contained and
//! logged, and the run continues with the same stop reason it would have had
//! without the hook.

use serde_json::Value;

use super::states::{RuntimeEvent, RuntimePhase, StepRecord};
use super::EngineResult;
use crate::decision::Decision;
use crate::error::StopReason;
use crate::state::AgentState;

/// Borrowed context handed to per-phase hooks.
pub struct HookContext<'a, S: AgentState> {
    pub task: &'a str,
    pub step_id: u64,
    pub phase: RuntimePhase,
    pub state: &'a S,
    pub env_view: Option<&'a Value>,
    pub observation: Option<&'a Value>,
    pub decision: Option<&'a Decision>,
    pub action_results: &'a [Value],
    pub stop_reason: Option<StopReason>,
    pub error: Option<&'a str>,
}

/// Lifecycle callbacks. Every method is optional; implement the subset you
/// need. Hooks run on the engine thread and must not block.
#[allow(unused_variables)]
pub trait EngineHook<S: AgentState>: Send + Sync {
    fn on_run_start(&self, task: &str, state: &S) {}
    fn on_run_end(&self, result: &EngineResult<S>) {}

    fn on_before_step(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_step(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_observe(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_observe(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_decide(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_decide(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_act(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_act(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_reduce(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_reduce(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_critic(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_critic(&self, ctx: &HookContext<'_, S>) {}

    fn on_before_check_stop(&self, ctx: &HookContext<'_, S>) {}
    fn on_after_check_stop(&self, ctx: &HookContext<'_, S>) {}

    fn on_recover(&self, ctx: &HookContext<'_, S>) {}

    fn on_event(&self, event: &RuntimeEvent, state: &S) {}
    fn on_step_end(&self, record: &StepRecord, state: &S) {}
}
