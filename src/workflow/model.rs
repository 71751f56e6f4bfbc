//! Workflow Data Model
//!
//! Core data structures representing workflows, their steps and the
//! scheduling metadata attached to each step.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: research
//! required_capabilities: [search, summarize]
//! steps:
//!   - id: gather
//!     capability: search
//!     parameters:
//!       query: rust async runtimes
//!
//!   - id: summarize_a
//!     capability: summarize
//!     execution_mode: parallel
//!     parallel_group: summaries
//!
//!   - id: report
//!     capability: write
//!     execution_mode: conditional
//!     conditions:
//!       - kind: success
//!         target: summarize_a
//!     retry_policy:
//!       max_retries: 2
//!       backoff_factor: 0.5
//!       retry_on: [failure]
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::condition::Condition;

/// Lifecycle status shared by workflows and steps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Assembled,
    Skipped,
}

impl Status {
    /// Lowercase label used in logs, metrics and stored records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Assembled => "assembled",
            Self::Skipped => "skipped",
        }
    }

    /// Parses a lowercase label.
    pub fn parse(label: &str) -> Option<Self> {
        let status = match label.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "assembled" => Self::Assembled,
            "skipped" => Self::Skipped,
            _ => return None,
        };
        Some(status)
    }

    /// Returns true for statuses a step never leaves during a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a step is scheduled relative to its siblings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
        }
    }
}

/// Outcome class that may trigger a retry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RetryTrigger {
    /// The worker replied with an unsuccessful outcome.
    Failure,
    /// The dispatch itself raised an error.
    Exception,
}

impl RetryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Exception => "exception",
        }
    }
}

/// Bounded-attempt backoff configuration for a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in seconds, doubled for each subsequent retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Outcome classes that are retried
    #[serde(default = "default_retry_on")]
    pub retry_on: BTreeSet<RetryTrigger>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_retry_on() -> BTreeSet<RetryTrigger> {
    [RetryTrigger::Failure, RetryTrigger::Exception]
        .into_iter()
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_factor: 0.0,
            retry_on: BTreeSet::new(),
        }
    }

    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            ..Self::default()
        }
    }

    /// Restricts the outcome classes that are retried.
    pub fn retry_on(mut self, triggers: impl IntoIterator<Item = RetryTrigger>) -> Self {
        self.retry_on = triggers.into_iter().collect();
        self
    }

    pub fn retries_on(&self, trigger: RetryTrigger) -> bool {
        self.retry_on.contains(&trigger)
    }

    /// Delay before the retry that follows attempt `attempt` (0-based).
    ///
    /// Saturates at `Duration::MAX` when the delay does not fit.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.backoff_factor * 2f64.powi(attempt.min(30) as i32);
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_workflow_status() -> Status {
    Status::Created
}

fn default_step_status() -> Status {
    Status::Pending
}

/// Represents a single dispatchable step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the owning workflow
    pub id: String,

    /// Capability key used to route the step to a worker
    pub capability: String,

    /// Message content sent to the worker
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default = "default_step_status")]
    pub status: Status,

    /// Identity of the worker the step was dispatched to
    #[serde(default)]
    pub assigned_agent: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Successor step ids (informational)
    #[serde(default)]
    pub next_steps: Option<Vec<String>>,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// AND-combined gate, evaluated only for conditional steps
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Group key, used only for parallel steps
    #[serde(default)]
    pub parallel_group: Option<String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Step {
    /// Creates a new sequential step.
    ///
    /// # Example
    ///
    /// ```
    /// use conductor::workflow::{ExecutionMode, Step};
    ///
    /// let step = Step::new("fetch", "search")
    ///     .with_parameter("query", "tokio joinset")
    ///     .in_parallel_group("lookups");
    ///
    /// assert_eq!(step.execution_mode, ExecutionMode::Parallel);
    /// ```
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            capability: capability.into().trim().to_string(),
            parameters: Map::new(),
            status: Status::Pending,
            assigned_agent: None,
            error: None,
            start_time: None,
            end_time: None,
            next_steps: None,
            execution_mode: ExecutionMode::Sequential,
            conditions: Vec::new(),
            parallel_group: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sets a single message parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replaces all message parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Schedules the step concurrently with the rest of `group`.
    pub fn in_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.execution_mode = ExecutionMode::Parallel;
        self.parallel_group = Some(group.into());
        self
    }

    /// Gates the step on a condition. May be called repeatedly; conditions AND.
    pub fn when(mut self, condition: Condition) -> Self {
        self.execution_mode = ExecutionMode::Conditional;
        self.conditions.push(condition);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_next_steps(mut self, next: Vec<String>) -> Self {
        self.next_steps = Some(next);
        self
    }

    /// The group this step joins when scheduled in parallel.
    pub fn group_key(&self) -> &str {
        self.parallel_group.as_deref().unwrap_or(DEFAULT_PARALLEL_GROUP)
    }

    /// Seconds between start and end, when both are stamped.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            }
            _ => None,
        }
    }

    /// Clears run state so the step can be dispatched again.
    pub fn reset(&mut self) {
        self.status = Status::Pending;
        self.assigned_agent = None;
        self.error = None;
        self.start_time = None;
        self.end_time = None;
    }
}

/// Group used for parallel steps that do not name one.
pub const DEFAULT_PARALLEL_GROUP: &str = "default";

/// Represents a complete workflow with multiple steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    #[serde(default = "generate_id")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_workflow_status")]
    pub status: Status,

    /// Ordered list of steps in the workflow
    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub error: Option<String>,
}

impl Workflow {
    /// Creates a new empty workflow with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            name: name.into(),
            description: String::new(),
            status: Status::Created,
            steps: Vec::new(),
            required_capabilities: BTreeSet::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut workflow = Self::new(name);
        workflow.steps = steps;
        workflow.refresh_capabilities();
        workflow
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.required_capabilities.insert(step.capability.clone());
        self.steps.push(step);
        self.touch();
        Ok(())
    }

    /// Removes a step from the workflow.
    pub fn remove_step(&mut self, id: &str) -> Result<Step, String> {
        let index = self
            .steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| format!("Step '{}' not found", id))?;

        // Drop successor references to the removed step
        for step in &mut self.steps {
            if let Some(next) = step.next_steps.as_mut() {
                next.retain(|s| s != id);
            }
        }

        let removed = self.steps.remove(index);
        self.touch();
        Ok(removed)
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Adds every step capability to `required_capabilities`.
    pub fn refresh_capabilities(&mut self) {
        for step in &self.steps {
            self.required_capabilities.insert(step.capability.clone());
        }
    }

    /// Advances `updated_at` to now. Never moves it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Number of distinct workers steps have been assigned to.
    pub fn agent_count(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|s| s.assigned_agent.as_deref())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Derives the terminal status over all steps.
    pub fn derived_status(&self) -> Status {
        derive_status(self.steps.iter())
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new("")
    }
}

/// Completed iff every non-skipped step completed; failed otherwise.
pub fn derive_status<'a>(steps: impl Iterator<Item = &'a Step>) -> Status {
    let all_completed = steps
        .filter(|s| s.status != Status::Skipped)
        .all(|s| s.status == Status::Completed);

    if all_completed {
        Status::Completed
    } else {
        Status::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_creation() {
        let step = Step::new(" fetch ", "search")
            .with_parameter("query", "rust")
            .with_retry_policy(RetryPolicy::new(1, 0.5));

        assert_eq!(step.id, "fetch");
        assert_eq!(step.capability, "search");
        assert_eq!(step.status, Status::Pending);
        assert_eq!(step.execution_mode, ExecutionMode::Sequential);
        assert_eq!(step.parameters["query"], "rust");
        assert_eq!(step.retry_policy.max_retries, 1);
    }

    #[test]
    fn test_parallel_step_group() {
        let step = Step::new("a", "search").in_parallel_group("lookups");
        assert_eq!(step.execution_mode, ExecutionMode::Parallel);
        assert_eq!(step.group_key(), "lookups");

        let mut ungrouped = Step::new("b", "search");
        ungrouped.execution_mode = ExecutionMode::Parallel;
        assert_eq!(ungrouped.group_key(), DEFAULT_PARALLEL_GROUP);
    }

    #[test]
    fn test_conditional_step() {
        let step = Step::new("report", "write")
            .when(Condition::success("a"))
            .when(Condition::success("b"));

        assert_eq!(step.execution_mode, ExecutionMode::Conditional);
        assert_eq!(step.conditions.len(), 2);
    }

    #[test]
    fn test_retry_backoff_saturates() {
        let huge = RetryPolicy::new(3, 1e12);
        assert_eq!(huge.backoff(30), Duration::MAX);
        assert_eq!(RetryPolicy::new(3, 1e20).backoff(0), Duration::MAX);
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy::new(3, 1.0);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));

        let negative = RetryPolicy::new(3, -1.0);
        assert_eq!(negative.backoff(1), Duration::ZERO);

        let nan = RetryPolicy::new(3, f64::NAN);
        assert_eq!(nan.backoff(0), Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.retries_on(RetryTrigger::Failure));
        assert!(policy.retries_on(RetryTrigger::Exception));

        let policy = RetryPolicy::none();
        assert!(!policy.retries_on(RetryTrigger::Failure));
    }

    #[test]
    fn test_workflow_add_duplicate_step() {
        let mut workflow = Workflow::new("test");
        workflow.add_step(Step::new("s1", "search")).unwrap();
        let result = workflow.add_step(Step::new("s1", "write"));

        assert!(result.is_err());
        assert_eq!(workflow.len(), 1);
        assert!(workflow.required_capabilities.contains("search"));
    }

    #[test]
    fn test_workflow_remove_step_cleans_successors() {
        let mut workflow = Workflow::from_steps(
            "test",
            vec![
                Step::new("s1", "search").with_next_steps(vec!["s2".to_string()]),
                Step::new("s2", "write"),
            ],
        );

        let removed = workflow.remove_step("s2").unwrap();
        assert_eq!(removed.id, "s2");
        assert_eq!(workflow.steps[0].next_steps, Some(vec![]));
        assert!(workflow.remove_step("missing").is_err());
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut workflow = Workflow::new("test");
        let future = Utc::now() + chrono::Duration::hours(1);
        workflow.updated_at = future;

        workflow.touch();
        assert_eq!(workflow.updated_at, future);
    }

    #[test]
    fn test_derived_status() {
        let mut workflow = Workflow::from_steps(
            "test",
            vec![Step::new("a", "x"), Step::new("b", "x"), Step::new("c", "x")],
        );
        workflow.steps[0].status = Status::Completed;
        workflow.steps[1].status = Status::Skipped;
        workflow.steps[2].status = Status::Completed;
        assert_eq!(workflow.derived_status(), Status::Completed);

        workflow.steps[2].status = Status::Pending;
        assert_eq!(workflow.derived_status(), Status::Failed);

        assert_eq!(Workflow::new("empty").derived_status(), Status::Completed);
    }

    #[test]
    fn test_agent_count() {
        let mut workflow = Workflow::from_steps(
            "test",
            vec![Step::new("a", "x"), Step::new("b", "x"), Step::new("c", "x")],
        );
        workflow.steps[0].assigned_agent = Some("w1".to_string());
        workflow.steps[1].assigned_agent = Some("w1".to_string());
        workflow.steps[2].assigned_agent = Some("w2".to_string());

        assert_eq!(workflow.agent_count(), 2);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(Status::Completed.to_string(), "completed");
        assert_eq!(Status::parse("FAILED"), Some(Status::Failed));
        assert_eq!(Status::parse("unknown"), None);
        assert!(Status::Skipped.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn test_workflow_yaml_defaults() {
        let yaml = r#"
name: demo
steps:
  - id: s1
    capability: search
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert!(!workflow.id.is_empty());
        assert_eq!(workflow.status, Status::Created);
        assert_eq!(workflow.steps[0].status, Status::Pending);
        assert_eq!(workflow.steps[0].retry_policy, RetryPolicy::default());
    }
}
