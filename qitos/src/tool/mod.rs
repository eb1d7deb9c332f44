//! Tool abstraction: named, parameter-typed callables with declared
//! permissions and required capability groups.
//!
//! Tools never receive raw engine internals. Each call gets its JSON args and
//! a [`ToolContext`] carrying the environment handle, the resolved ops groups
//! the tool declared in `required_ops`, and a snapshot of the base state.

mod registry;

pub use registry::{RegisteredTool, ToolOrigin, ToolRegistry, Toolset};

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::env::Env;
use crate::error::RuntimeError;

/// Declared side-effect surface of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolPermission {
    #[serde(default)]
    pub filesystem_read: bool,
    #[serde(default)]
    pub filesystem_write: bool,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub command: bool,
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
}

/// Static description of a tool: identity, parameter schema, permissions and
/// the capability groups it needs from the environment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParam>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub permissions: ToolPermission,
    #[serde(default)]
    pub required_ops: Vec<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_param(
        mut self,
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.parameters.insert(
            name.clone(),
            ToolParam {
                param_type: param_type.into(),
                description: description.into(),
            },
        );
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn with_required_ops<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_ops = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions(mut self, permissions: ToolPermission) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: f64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    /// Dispatch-time argument validation against the declared schema.
    pub fn validate_args(&self, args: &Map<String, Value>) -> Result<(), ToolError> {
        for name in &self.required {
            if !args.contains_key(name) {
                return Err(ToolError::InvalidArgs(format!(
                    "tool '{}' missing required argument '{}'",
                    self.name, name
                )));
            }
        }
        Ok(())
    }
}

/// Tool failure, surfaced into `ActionResult` rather than raised past the
/// executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool name collision: '{0}'")]
    NameCollision(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("missing ops group: {0}")]
    MissingOps(String),
    #[error("tool execution: {0}")]
    Execution(String),
    #[error("toolset lifecycle: {0}")]
    Lifecycle(String),
}

impl From<ToolError> for RuntimeError {
    fn from(err: ToolError) -> Self {
        RuntimeError::Tool(err.to_string())
    }
}

/// A capability bundle handed to tools; concrete envs expose these by group
/// name and tools downcast to the concrete ops type they expect.
pub type OpsHandle = Arc<dyn Any + Send + Sync>;

/// Per-call runtime context. Replaces parameter-name injection: every tool
/// takes the full context and pulls what it needs.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub env: Option<Arc<dyn Env>>,
    pub ops: HashMap<String, OpsHandle>,
    pub state: Value,
}

impl ToolContext {
    /// Downcast a resolved ops group to its concrete type.
    pub fn ops_group<T: Any + Send + Sync>(&self, group: &str) -> Option<Arc<T>> {
        self.ops.get(group).and_then(|handle| {
            Arc::clone(handle).downcast::<T>().ok()
        })
    }
}

/// A named, parameter-typed callable.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, args: Map<String, Value>, ctx: &ToolContext)
        -> Result<Value, ToolError>;
}

type ToolFn = dyn Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// Adapter for plain functions: the closure sees only its named args, never
/// the runtime context.
pub struct FunctionTool {
    spec: ToolSpec,
    func: Box<ToolFn>,
}

impl FunctionTool {
    pub fn new<F>(spec: ToolSpec, func: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            spec,
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(
        &self,
        args: Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        self.spec.validate_args(&args)?;
        (self.func)(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> FunctionTool {
        let spec = ToolSpec::new("add", "Add two integers.")
            .with_param("a", "integer", "left operand", true)
            .with_param("b", "integer", "right operand", true);
        FunctionTool::new(spec, |args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
    }

    /// **Scenario**: a function tool computes from its named args only.
    #[tokio::test]
    async fn function_tool_call() {
        let tool = add_tool();
        let mut args = Map::new();
        args.insert("a".into(), json!(40));
        args.insert("b".into(), json!(2));
        let out = tool.call(args, &ToolContext::default()).await.unwrap();
        assert_eq!(out, json!(42));
    }

    /// **Scenario**: a missing required argument fails before the closure runs.
    #[tokio::test]
    async fn function_tool_missing_required_arg() {
        let tool = add_tool();
        let mut args = Map::new();
        args.insert("a".into(), json!(1));
        let err = tool.call(args, &ToolContext::default()).await.unwrap_err();
        assert!(err.to_string().contains("required argument 'b'"));
    }

    /// **Scenario**: ops handles downcast to their concrete group type.
    #[test]
    fn context_ops_downcast() {
        struct FileOps {
            root: String,
        }
        let mut ctx = ToolContext::default();
        ctx.ops.insert(
            "file".into(),
            Arc::new(FileOps {
                root: "/tmp".into(),
            }),
        );
        let ops = ctx.ops_group::<FileOps>("file").unwrap();
        assert_eq!(ops.root, "/tmp");
        assert!(ctx.ops_group::<String>("file").is_none());
        assert!(ctx.ops_group::<FileOps>("process").is_none());
    }
}
