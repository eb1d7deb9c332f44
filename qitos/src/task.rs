//! Task contract: objective, resources, environment spec and budget.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-task budget. A set field overrides the engine's base budget for the run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// A file or directory the task depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResource {
    pub kind: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_to: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Environment requested by a task, instantiated by type tag at INIT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    #[serde(rename = "type")]
    pub env_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// One problem found while validating task resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskValidationIssue {
    pub resource: String,
    pub message: String,
    pub required: bool,
}

/// A runnable unit of work handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub objective: String,
    #[serde(default)]
    pub resources: Vec<TaskResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_spec: Option<EnvSpec>,
    #[serde(default)]
    pub budget: TaskBudget,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objective: objective.into(),
            resources: Vec::new(),
            env_spec: None,
            budget: TaskBudget::default(),
            success_criteria: Vec::new(),
        }
    }

    pub fn with_budget(mut self, budget: TaskBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_env_spec(mut self, spec: EnvSpec) -> Self {
        self.env_spec = Some(spec);
        self
    }

    pub fn with_resource(mut self, resource: TaskResource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Resolve resource paths against a workspace and collect issues for
    /// missing ones. A missing required resource fails task validation at
    /// INIT; optional ones only warn.
    pub fn validate_resources(&self, workspace: Option<&Path>) -> Vec<TaskValidationIssue> {
        let mut issues = Vec::new();
        for resource in &self.resources {
            let raw = PathBuf::from(&resource.path);
            let resolved = if raw.is_absolute() {
                raw
            } else {
                match workspace {
                    Some(root) => root.join(&raw),
                    None => raw,
                }
            };
            if !resolved.exists() {
                issues.push(TaskValidationIssue {
                    resource: resource.path.clone(),
                    message: format!("resource path not found: {}", resolved.display()),
                    required: resource.required,
                });
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Task round-trips through its JSON form structurally.
    #[test]
    fn task_round_trip() {
        let task = Task::new("t-1", "compute 40+2")
            .with_budget(TaskBudget {
                max_steps: Some(3),
                max_runtime_seconds: None,
                max_tokens: Some(2048),
            })
            .with_env_spec(EnvSpec {
                env_type: "host".into(),
                config: Map::new(),
            })
            .with_resource(TaskResource {
                kind: "file".into(),
                path: "data/input.txt".into(),
                mount_to: None,
                required: true,
            });
        let value = task.to_value();
        assert_eq!(value["env_spec"]["type"], "host");
        let back = Task::from_value(&value).unwrap();
        assert_eq!(back, task);
    }

    /// **Scenario**: resources resolve against the workspace; missing ones are reported.
    #[test]
    fn validate_resources_against_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "ok").unwrap();

        let task = Task::new("t-2", "read files")
            .with_resource(TaskResource {
                kind: "file".into(),
                path: "present.txt".into(),
                mount_to: None,
                required: true,
            })
            .with_resource(TaskResource {
                kind: "file".into(),
                path: "missing.txt".into(),
                mount_to: None,
                required: true,
            });

        let issues = task.validate_resources(Some(dir.path()));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].resource, "missing.txt");
        assert!(issues[0].required);
    }

    /// **Scenario**: a budget field left unset stays None after parsing.
    #[test]
    fn budget_partial_parse() {
        let task = Task::from_value(&json!({
            "id": "t",
            "objective": "o",
            "budget": {"max_steps": 1},
        }))
        .unwrap();
        assert_eq!(task.budget.max_steps, Some(1));
        assert_eq!(task.budget.max_tokens, None);
    }
}
