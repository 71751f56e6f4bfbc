//! Workflow Templates
//!
//! Named step skeletons that synthesize new workflows from caller
//! parameters. String parameters may carry `{name}` placeholders:
//!
//! - a value that is exactly `"{name}"` is replaced by the caller's value,
//!   keeping its JSON type
//! - any other `{name}` inside a string is replaced by the value's text
//!
//! Unknown placeholders are left untouched.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::condition::{Condition, WorkflowBranch};
use super::model::{ExecutionMode, RetryPolicy, Step, Workflow};

/// One step of a template skeleton.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TemplateStep {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl TemplateStep {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            parameters: Map::new(),
            execution_mode: ExecutionMode::Sequential,
            parallel_group: None,
            conditions: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn in_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.execution_mode = ExecutionMode::Parallel;
        self.parallel_group = Some(group.into());
        self
    }
}

/// A reusable workflow skeleton.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TemplateStep>,
    #[serde(default)]
    pub branches: Vec<WorkflowBranch>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, steps: Vec<TemplateStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            branches: Vec::new(),
            required_capabilities: BTreeSet::new(),
        }
    }

    pub fn with_branch(mut self, branch: WorkflowBranch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Builds a fresh workflow, substituting `params` into every step.
    pub fn instantiate(&self, params: &Map<String, Value>) -> Workflow {
        self.instantiate_with_retry(params, &RetryPolicy::default())
    }

    /// Like [`instantiate`](Self::instantiate), giving steps without their
    /// own policy `default_retry`.
    pub fn instantiate_with_retry(
        &self,
        params: &Map<String, Value>,
        default_retry: &RetryPolicy,
    ) -> Workflow {
        let mut workflow = Workflow::new(self.name.clone())
            .with_description(substitute_str(&self.description, params));
        workflow.required_capabilities = self.required_capabilities.clone();
        workflow
            .metadata
            .insert("template".to_string(), Value::String(self.name.clone()));

        for skeleton in &self.steps {
            let mut step = Step::new(skeleton.id.clone(), skeleton.capability.clone());
            step.parameters = skeleton
                .parameters
                .iter()
                .map(|(key, value)| (key.clone(), substitute(value, params)))
                .collect();
            step.execution_mode = skeleton.execution_mode;
            step.parallel_group = skeleton.parallel_group.clone();
            step.conditions = skeleton.conditions.clone();
            step.retry_policy = skeleton
                .retry_policy
                .clone()
                .unwrap_or_else(|| default_retry.clone());

            for branch in self.branches.iter().filter(|b| b.covers(&step.id)) {
                step.execution_mode = ExecutionMode::Conditional;
                step.conditions.push(branch.condition.clone());
            }

            workflow.required_capabilities.insert(step.capability.clone());
            workflow.steps.push(step);
        }

        debug!(
            "Instantiated template '{}' as workflow {} ({} steps)",
            self.name,
            workflow.id,
            workflow.steps.len()
        );
        workflow
    }
}

/// Substitutes placeholders in any JSON value, recursing into containers.
pub fn substitute(value: &Value, params: &Map<String, Value>) -> Value {
    match value {
        Value::String(text) => {
            if let Some(name) = whole_placeholder(text) {
                if let Some(replacement) = params.get(name) {
                    return replacement.clone();
                }
            }
            Value::String(substitute_str(text, params))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replaces each `{name}` in `text` with the parameter's text.
fn substitute_str(text: &str, params: &Map<String, Value>) -> String {
    let mut output = text.to_string();
    for (name, value) in params {
        let placeholder = format!("{{{}}}", name);
        if output.contains(&placeholder) {
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            output = output.replace(&placeholder, &replacement);
        }
    }
    output
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}']) {
        None
    } else {
        Some(inner)
    }
}

/// Name-indexed collection of templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, WorkflowTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template, replacing any with the same name.
    pub fn register(&mut self, template: WorkflowTemplate) -> Option<WorkflowTemplate> {
        self.templates.insert(template.name.clone(), template)
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn instantiate(&self, name: &str, params: &Map<String, Value>) -> Option<Workflow> {
        self.get(name).map(|template| template.instantiate(params))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
