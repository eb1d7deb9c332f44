//! Tool registry: catalogs individual tools and grouped toolsets, keeps
//! origin provenance, and runs toolset lifecycle once per run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use super::{Tool, ToolContext, ToolError, ToolSpec};

/// Where a registered tool came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOrigin {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset_version: Option<String>,
}

impl ToolOrigin {
    pub fn function() -> Self {
        Self {
            source: "function".into(),
            toolset_name: None,
            toolset_version: None,
        }
    }

    pub fn toolset(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            source: "toolset".into(),
            toolset_name: Some(name.into()),
            toolset_version: Some(version.into()),
        }
    }
}

/// A group of tools sharing lifecycle and a name/version identity.
#[async_trait]
pub trait Toolset: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>>;

    async fn setup(&self, _context: &Map<String, Value>) -> Result<(), ToolError> {
        Ok(())
    }

    async fn teardown(&self, _context: &Map<String, Value>) -> Result<(), ToolError> {
        Ok(())
    }
}

/// A tool plus its registry identity (possibly namespaced) and origin.
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub spec: ToolSpec,
    pub origin: ToolOrigin,
}

/// Registry for tools and toolsets. Built before a run, read-only after
/// `setup`; shared with the executor via `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    toolsets: Vec<Arc<dyn Toolset>>,
    setup_done: AtomicBool,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("toolsets_len", &self.toolsets.len())
            .field("setup_done", &self.setup_done)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one tool under its spec name. A name collision is an error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, ToolError> {
        let spec = tool.spec();
        let name = spec.name.clone();
        self.insert(name, tool, spec, ToolOrigin::function())
    }

    /// Register one tool under an explicit name.
    pub fn register_as(
        &mut self,
        tool: Arc<dyn Tool>,
        name: impl Into<String>,
    ) -> Result<&mut Self, ToolError> {
        let name = name.into();
        let mut spec = tool.spec();
        spec.name = name.clone();
        self.insert(name, tool, spec, ToolOrigin::function())
    }

    /// Register a batch of tools.
    pub fn include<I>(&mut self, tools: I) -> Result<&mut Self, ToolError>
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(self)
    }

    /// Register every tool of a toolset as `{namespace}.{tool}`; the default
    /// namespace is the toolset name.
    pub fn register_toolset(
        &mut self,
        toolset: Arc<dyn Toolset>,
        namespace: Option<&str>,
    ) -> Result<&mut Self, ToolError> {
        let toolset_name = toolset.name().to_string();
        let toolset_version = toolset.version().to_string();
        let prefix = namespace.unwrap_or(&toolset_name).to_string();
        for tool in toolset.tools() {
            let mut spec = tool.spec();
            let full_name = if prefix.is_empty() {
                spec.name.clone()
            } else {
                format!("{prefix}.{}", spec.name)
            };
            spec.name = full_name.clone();
            self.insert(
                full_name,
                tool,
                spec,
                ToolOrigin::toolset(&toolset_name, &toolset_version),
            )?;
        }
        self.toolsets.push(toolset);
        Ok(self)
    }

    fn insert(
        &mut self,
        name: String,
        tool: Arc<dyn Tool>,
        spec: ToolSpec,
        origin: ToolOrigin,
    ) -> Result<&mut Self, ToolError> {
        if self.tools.contains_key(&name) {
            return Err(ToolError::NameCollision(name));
        }
        self.tools.insert(name, RegisteredTool { tool, spec, origin });
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn list_tools(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn list_toolsets(&self) -> Vec<String> {
        self.toolsets
            .iter()
            .map(|toolset| toolset.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Name, description and origin provenance for one tool.
    pub fn describe_tool(&self, name: &str) -> Result<Value, ToolError> {
        let entry = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        Ok(json!({
            "name": entry.spec.name,
            "description": entry.spec.description,
            "origin": entry.origin,
        }))
    }

    /// Direct invocation with no runtime context. Tools that need env ops go
    /// through the executor instead.
    pub async fn call(&self, name: &str, args: Map<String, Value>) -> Result<Value, ToolError> {
        let entry = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        entry.spec.validate_args(&args)?;
        entry.tool.call(args, &ToolContext::default()).await
    }

    /// Run toolset setup once per registry per run.
    pub async fn setup(&self, context: &Map<String, Value>) -> Result<(), ToolError> {
        if self.setup_done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for toolset in &self.toolsets {
            toolset.setup(context).await?;
        }
        Ok(())
    }

    /// Run toolset teardown in reverse registration order. Errors are
    /// captured and returned (for trace lifecycle events), never raised.
    pub async fn teardown(&self, context: &Map<String, Value>) -> Vec<(String, ToolError)> {
        let mut failures = Vec::new();
        for toolset in self.toolsets.iter().rev() {
            if let Err(err) = toolset.teardown(context).await {
                warn!(toolset = toolset.name(), error = %err, "toolset teardown failed");
                failures.push((toolset.name().to_string(), err));
            }
        }
        self.setup_done.store(false, Ordering::SeqCst);
        failures
    }

    /// Serializable catalog of every tool: schema, origin and permissions.
    /// Used to render a tool-schema description for prompts.
    pub fn all_specs(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|entry| {
                json!({
                    "type": "function",
                    "function": {
                        "name": entry.spec.name,
                        "description": entry.spec.description,
                        "parameters": {
                            "type": "object",
                            "properties": entry.spec.parameters,
                            "required": entry.spec.required,
                        },
                    },
                    "origin": entry.origin,
                    "permissions": entry.spec.permissions,
                    "required_ops": entry.spec.required_ops,
                })
            })
            .collect()
    }

    /// Human-readable tool catalog for prompt assembly.
    pub fn render_tool_descriptions(&self) -> String {
        let mut lines = Vec::new();
        for entry in self.tools.values() {
            lines.push(format!("## {}", entry.spec.name));
            lines.push(format!("Description: {}", entry.spec.description));
            lines.push(format!("Source: {}", entry.origin.source));
            if let (Some(name), Some(version)) =
                (&entry.origin.toolset_name, &entry.origin.toolset_version)
            {
                lines.push(format!("ToolSet: {name}@{version}"));
            }
            lines.push("Parameters:".to_string());
            for (param, schema) in &entry.spec.parameters {
                let marker = if entry.spec.required.contains(param) {
                    ", required"
                } else {
                    ""
                };
                lines.push(format!("  - {param} ({}{marker})", schema.param_type));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FunctionTool;
    use serde_json::json;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        let spec = ToolSpec::new(name, "Echo the input back.").with_param(
            "text",
            "string",
            "text to echo",
            true,
        );
        Arc::new(FunctionTool::new(spec, |args| {
            Ok(args.get("text").cloned().unwrap_or(Value::Null))
        }))
    }

    struct MathToolset;

    #[async_trait]
    impl Toolset for MathToolset {
        fn name(&self) -> &str {
            "math"
        }

        fn version(&self) -> &str {
            "1.2"
        }

        fn tools(&self) -> Vec<Arc<dyn Tool>> {
            let spec = ToolSpec::new("add", "Add two integers.")
                .with_param("a", "integer", "", true)
                .with_param("b", "integer", "", true);
            vec![Arc::new(FunctionTool::new(spec, |args| {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            }))]
        }
    }

    /// **Scenario**: duplicate tool names are rejected with a collision error.
    #[test]
    fn register_rejects_collision() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        let err = registry.register(echo_tool("echo")).unwrap_err();
        assert!(matches!(err, ToolError::NameCollision(name) if name == "echo"));
    }

    /// **Scenario**: toolset tools register namespaced with toolset provenance.
    #[test]
    fn register_toolset_namespaces_and_tags_origin() {
        let mut registry = ToolRegistry::new();
        registry
            .register_toolset(Arc::new(MathToolset), None)
            .unwrap();
        assert_eq!(registry.list_tools(), vec!["math.add".to_string()]);
        assert_eq!(registry.list_toolsets(), vec!["math".to_string()]);

        let described = registry.describe_tool("math.add").unwrap();
        assert_eq!(described["origin"]["source"], "toolset");
        assert_eq!(described["origin"]["toolset_name"], "math");
        assert_eq!(described["origin"]["toolset_version"], "1.2");
    }

    /// **Scenario**: an explicit namespace overrides the toolset name.
    #[test]
    fn register_toolset_custom_namespace() {
        let mut registry = ToolRegistry::new();
        registry
            .register_toolset(Arc::new(MathToolset), Some("calc"))
            .unwrap();
        assert_eq!(registry.list_tools(), vec!["calc.add".to_string()]);
    }

    /// **Scenario**: direct call dispatches by name; unknown names error.
    #[tokio::test]
    async fn direct_call() {
        let mut registry = ToolRegistry::new();
        registry
            .register_toolset(Arc::new(MathToolset), None)
            .unwrap();
        let mut args = Map::new();
        args.insert("a".into(), json!(40));
        args.insert("b".into(), json!(2));
        assert_eq!(registry.call("math.add", args).await.unwrap(), json!(42));

        let missing = registry.call("nope", Map::new()).await.unwrap_err();
        assert!(matches!(missing, ToolError::NotFound(_)));
    }

    /// **Scenario**: the spec catalog includes schema, origin and permissions.
    #[test]
    fn all_specs_catalog() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        let specs = registry.all_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0]["function"]["name"], "echo");
        assert_eq!(specs[0]["origin"]["source"], "function");
        assert_eq!(specs[0]["function"]["parameters"]["required"][0], "text");

        let rendered = registry.render_tool_descriptions();
        assert!(rendered.contains("## echo"));
        assert!(rendered.contains("text (string, required)"));
    }

    /// **Scenario**: setup runs toolsets once; a second setup is a no-op.
    #[tokio::test]
    async fn setup_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingToolset {
            setups: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Toolset for CountingToolset {
            fn name(&self) -> &str {
                "counting"
            }

            fn tools(&self) -> Vec<Arc<dyn Tool>> {
                Vec::new()
            }

            async fn setup(&self, _context: &Map<String, Value>) -> Result<(), ToolError> {
                self.setups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let setups = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry
            .register_toolset(
                Arc::new(CountingToolset {
                    setups: Arc::clone(&setups),
                }),
                None,
            )
            .unwrap();
        registry.setup(&Map::new()).await.unwrap();
        registry.setup(&Map::new()).await.unwrap();
        assert_eq!(setups.load(Ordering::SeqCst), 1);
    }

    /// **Scenario**: teardown failures are captured, not raised.
    #[tokio::test]
    async fn teardown_captures_errors() {
        struct FlakyToolset;

        #[async_trait]
        impl Toolset for FlakyToolset {
            fn name(&self) -> &str {
                "flaky"
            }

            fn tools(&self) -> Vec<Arc<dyn Tool>> {
                Vec::new()
            }

            async fn teardown(&self, _context: &Map<String, Value>) -> Result<(), ToolError> {
                Err(ToolError::Lifecycle("port still open".into()))
            }
        }

        let mut registry = ToolRegistry::new();
        registry
            .register_toolset(Arc::new(FlakyToolset), None)
            .unwrap();
        registry.setup(&Map::new()).await.unwrap();
        let failures = registry.teardown(&Map::new()).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "flaky");
    }
}
