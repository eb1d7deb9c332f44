//! Action executor: runs a normalized action batch against the tool registry.
//!
//! Serial by default for reproducibility; the parallel policy knob is
//! accepted but execution stays serial and results keep action order. Each
//! action is executed at most once unless it carries its own retry budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::action::{Action, ActionResult, ActionStatus, ExecutionPolicy};
use crate::env::Env;
use crate::state::StateSchema;
use crate::tool::{OpsHandle, ToolContext, ToolError, ToolRegistry};

pub struct ActionExecutor {
    registry: Arc<ToolRegistry>,
    policy: ExecutionPolicy,
}

impl ActionExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Execute a batch. Result order always matches action order.
    pub async fn execute(
        &self,
        actions: &[Action],
        env: Option<&Arc<dyn Env>>,
        state: &StateSchema,
    ) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let result = self.execute_one(action, env, state).await;
            let failed = !result.is_success();
            results.push(result);
            if failed && self.policy.fail_fast {
                for skipped in &actions[results.len()..] {
                    results.push(ActionResult {
                        name: skipped.name.clone(),
                        status: ActionStatus::Skipped,
                        output: None,
                        error: Some("skipped after earlier failure".into()),
                        action_id: skipped.action_id.clone(),
                        attempts: 0,
                        latency_ms: 0.0,
                        metadata: self.provenance(&skipped.name),
                    });
                }
                break;
            }
        }
        results
    }

    async fn execute_one(
        &self,
        action: &Action,
        env: Option<&Arc<dyn Env>>,
        state: &StateSchema,
    ) -> ActionResult {
        let start = Instant::now();
        let mut metadata = self.provenance(&action.name);

        // Ops requirements are checked once, before any attempt: a tool that
        // cannot get its capability groups must not run at all.
        let ops = match self.resolve_ops(&action.name, env) {
            Ok(ops) => ops,
            Err(err) => {
                metadata.insert("error_category".into(), json!("runtime_error"));
                return ActionResult {
                    name: action.name.clone(),
                    status: ActionStatus::Error,
                    output: None,
                    error: Some(err.to_string()),
                    action_id: action.action_id.clone(),
                    attempts: 1,
                    latency_ms: elapsed_ms(start),
                    metadata,
                };
            }
        };

        let ctx = ToolContext {
            env: env.cloned(),
            ops,
            state: state.to_value(),
        };

        let max_attempts = action.max_retries + 1;
        let mut attempts = 0u32;
        let mut last_error: Option<ToolError> = None;

        while attempts < max_attempts {
            attempts += 1;
            match self.call_tool(action, &ctx).await {
                Ok(output) => {
                    metadata.insert("error_category".into(), Value::Null);
                    return ActionResult {
                        name: action.name.clone(),
                        status: ActionStatus::Success,
                        output: Some(output),
                        error: None,
                        action_id: action.action_id.clone(),
                        attempts,
                        latency_ms: elapsed_ms(start),
                        metadata,
                    };
                }
                Err(err) => {
                    warn!(tool = %action.name, attempt = attempts, error = %err, "tool call failed");
                    last_error = Some(err);
                }
            }
        }

        let not_found = matches!(last_error, Some(ToolError::NotFound(_)));
        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown action execution error".into());
        let category = if not_found {
            "tool_not_found"
        } else {
            "runtime_error"
        };
        metadata.insert("error_category".into(), json!(category));
        ActionResult {
            name: action.name.clone(),
            status: ActionStatus::Error,
            output: None,
            error: Some(error),
            action_id: action.action_id.clone(),
            attempts,
            latency_ms: elapsed_ms(start),
            metadata,
        }
    }

    async fn call_tool(&self, action: &Action, ctx: &ToolContext) -> Result<Value, ToolError> {
        let entry = self
            .registry
            .get(&action.name)
            .ok_or_else(|| ToolError::NotFound(action.name.clone()))?;
        entry.spec.validate_args(&action.args)?;

        let timeout_s = action.timeout_s.or(entry.spec.timeout_s);
        let call = entry.tool.call(action.args.clone(), ctx);
        match timeout_s {
            Some(secs) if secs > 0.0 => {
                match tokio::time::timeout(Duration::from_secs_f64(secs), call).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Execution(format!(
                        "tool '{}' timed out after {secs}s",
                        action.name
                    ))),
                }
            }
            _ => call.await,
        }
    }

    fn resolve_ops(
        &self,
        name: &str,
        env: Option<&Arc<dyn Env>>,
    ) -> Result<HashMap<String, OpsHandle>, ToolError> {
        let required = self
            .registry
            .get(name)
            .map(|entry| entry.spec.required_ops.clone())
            .unwrap_or_default();
        if required.is_empty() {
            return Ok(HashMap::new());
        }
        let Some(env) = env else {
            return Err(ToolError::MissingOps(format!(
                "tool '{name}' requires ops {required:?} but no env was provided"
            )));
        };
        let mut resolved = HashMap::new();
        for group in required {
            let handle = env.ops(&group).ok_or_else(|| {
                ToolError::MissingOps(format!(
                    "env '{}' missing required ops group: {group}",
                    env.name()
                ))
            })?;
            resolved.insert(group, handle);
        }
        Ok(resolved)
    }

    fn provenance(&self, name: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        match self.registry.get(name) {
            Some(entry) => {
                metadata.insert("tool_name".into(), json!(entry.spec.name));
                metadata.insert(
                    "toolset_name".into(),
                    json!(entry.origin.toolset_name),
                );
                metadata.insert(
                    "toolset_version".into(),
                    json!(entry.origin.toolset_version),
                );
                metadata.insert("source".into(), json!(entry.origin.source));
            }
            None => {
                metadata.insert("tool_name".into(), json!(name));
                metadata.insert("toolset_name".into(), Value::Null);
                metadata.insert("toolset_version".into(), Value::Null);
                metadata.insert("source".into(), json!("unknown"));
            }
        }
        metadata
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;
    use crate::tool::{FunctionTool, Tool, ToolSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with_add() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        let spec = ToolSpec::new("add", "Add two integers.")
            .with_param("a", "integer", "", true)
            .with_param("b", "integer", "", true);
        registry
            .register(Arc::new(FunctionTool::new(spec, |args| {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })))
            .unwrap();
        Arc::new(registry)
    }

    /// **Scenario**: a successful action records output, latency and provenance.
    #[tokio::test]
    async fn execute_success() {
        let executor = ActionExecutor::new(registry_with_add());
        let action = Action::new("add")
            .with_arg("a", json!(40))
            .with_arg("b", json!(2));
        let results = executor
            .execute(&[action], None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert_eq!(results[0].output, Some(json!(42)));
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].metadata["source"], "function");
        assert_eq!(results[0].metadata["error_category"], Value::Null);
    }

    /// **Scenario**: an unknown tool fails with the tool_not_found category.
    #[tokio::test]
    async fn execute_unknown_tool() {
        let executor = ActionExecutor::new(registry_with_add());
        let results = executor
            .execute(&[Action::new("subtract")], None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results[0].status, ActionStatus::Error);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].metadata["error_category"], "tool_not_found");
        assert_eq!(results[0].metadata["source"], "unknown");
    }

    struct FlakyTool {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("flaky", "Fails until the nth call.")
        }

        async fn call(
            &self,
            _args: Map<String, Value>,
            _ctx: &ToolContext,
        ) -> Result<Value, ToolError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                Err(ToolError::Execution(format!("transient failure {call}")))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    /// **Scenario**: retries stay within the budget; attempts land in [1, k+1].
    #[tokio::test]
    async fn execute_with_retries() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FlakyTool {
                calls: AtomicU32::new(0),
                succeed_on: 3,
            }))
            .unwrap();
        let executor = ActionExecutor::new(Arc::new(registry));

        let action = Action::new("flaky").with_max_retries(2);
        let results = executor
            .execute(&[action], None, &StateSchema::new("t", 5))
            .await;
        assert!(results[0].is_success());
        assert_eq!(results[0].attempts, 3);
    }

    /// **Scenario**: max_retries=0 plus a raising tool yields exactly one
    /// error result with attempts=1.
    #[tokio::test]
    async fn execute_no_retry_single_attempt() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FlakyTool {
                calls: AtomicU32::new(0),
                succeed_on: u32::MAX,
            }))
            .unwrap();
        let executor = ActionExecutor::new(Arc::new(registry));

        let results = executor
            .execute(&[Action::new("flaky")], None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ActionStatus::Error);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].metadata["error_category"], "runtime_error");
    }

    /// **Scenario**: required ops fail immediately without consuming retries.
    #[tokio::test]
    async fn execute_missing_ops_no_retry() {
        let mut registry = ToolRegistry::new();
        let spec = ToolSpec::new("read_file", "Read a file.").with_required_ops(["file"]);
        registry
            .register(Arc::new(FunctionTool::new(spec, |_| Ok(json!("never")))))
            .unwrap();
        let executor = ActionExecutor::new(Arc::new(registry));

        // No env at all.
        let action = Action::new("read_file").with_max_retries(5);
        let results = executor
            .execute(&[action.clone()], None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results[0].status, ActionStatus::Error);
        assert_eq!(results[0].attempts, 1);
        assert!(results[0].error.as_ref().unwrap().contains("no env"));

        // Env present but missing the group.
        let env: Arc<dyn Env> = Arc::new(InMemoryEnv::new());
        let results = executor
            .execute(&[action], Some(&env), &StateSchema::new("t", 5))
            .await;
        assert_eq!(results[0].attempts, 1);
        assert!(results[0]
            .error
            .as_ref()
            .unwrap()
            .contains("missing required ops group"));
    }

    /// **Scenario**: a per-action timeout is treated like any other failure.
    #[tokio::test]
    async fn execute_timeout() {
        struct SlowTool;

        #[async_trait]
        impl Tool for SlowTool {
            fn spec(&self) -> ToolSpec {
                ToolSpec::new("slow", "Sleeps.")
            }

            async fn call(
                &self,
                _args: Map<String, Value>,
                _ctx: &ToolContext,
            ) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("done"))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).unwrap();
        let executor = ActionExecutor::new(Arc::new(registry));

        let action = Action::new("slow").with_timeout_s(0.05);
        let results = executor
            .execute(&[action], None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results[0].status, ActionStatus::Error);
        assert!(results[0].error.as_ref().unwrap().contains("timed out"));
    }

    /// **Scenario**: fail_fast skips the rest of the batch after a failure.
    #[tokio::test]
    async fn execute_fail_fast_skips_rest() {
        let executor = ActionExecutor::new(registry_with_add()).with_policy(ExecutionPolicy {
            fail_fast: true,
            ..ExecutionPolicy::default()
        });
        let actions = vec![
            Action::new("missing"),
            Action::new("add")
                .with_arg("a", json!(1))
                .with_arg("b", json!(2)),
        ];
        let results = executor
            .execute(&actions, None, &StateSchema::new("t", 5))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, ActionStatus::Error);
        assert_eq!(results[1].status, ActionStatus::Skipped);
    }
}
