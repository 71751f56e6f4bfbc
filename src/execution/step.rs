//! Individual Step Execution
//!
//! Handles the dispatch of a single workflow step:
//! - Marking the step running and stamping its start time
//! - Resolving a worker through the capability cache
//! - Sending the step parameters with bounded retry
//! - Writing the outcome back to the step and reporting it to the monitor

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::monitoring::{MetricsUpdate, Monitor};
use crate::registry::{CapabilityCache, Message};
use crate::workflow::{Status, Step};

use super::engine::SharedWorkflow;
use super::retry::{dispatch_with_retry, DispatchOutcome};

/// Recorded outcome of one step within a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StepResult {
    pub success: bool,

    /// Content of the last worker reply
    #[serde(default)]
    pub content: Map<String, Value>,

    /// Worker invocations made; 0 when no worker was found
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Machine-readable error label, see [`StepError::kind`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    #[serde(default)]
    pub duration_secs: f64,
}

impl StepResult {
    /// A result for a step that never reached a worker.
    pub fn unrouted(error: &StepError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            ..Self::default()
        }
    }

    fn from_outcome(outcome: DispatchOutcome, agent: &str) -> Self {
        let content = outcome
            .response
            .map(|response| response.content)
            .unwrap_or_default();

        Self {
            success: outcome.error.is_none(),
            content,
            attempts: outcome.attempts,
            error: outcome.error.as_ref().map(ToString::to_string),
            error_kind: outcome.error.as_ref().map(|e| e.kind().to_string()),
            agent: Some(agent.to_string()),
            duration_secs: 0.0,
        }
    }
}

/// A finished step together with its wall-clock span.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub step_id: String,
    pub result: StepResult,
    pub started: Instant,
    pub finished: Instant,
}

/// Everything a step task needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct StepDispatcher {
    cache: Arc<CapabilityCache>,
    monitor: Option<Arc<Monitor>>,
    sender_id: String,
}

impl StepDispatcher {
    pub fn new(cache: Arc<CapabilityCache>, sender_id: impl Into<String>) -> Self {
        Self {
            cache,
            monitor: None,
            sender_id: sender_id.into(),
        }
    }

    pub fn set_monitor(&mut self, monitor: Arc<Monitor>) {
        self.monitor = Some(monitor);
    }

    pub fn cache(&self) -> &Arc<CapabilityCache> {
        &self.cache
    }

    /// Executes `step` and records its outcome on the shared workflow.
    ///
    /// Step failures are returned as data; this never errors.
    pub async fn execute(&self, workflow: &SharedWorkflow, step: Step) -> StepRun {
        let started = Instant::now();
        let workflow_id = mark_running(workflow, &step.id).await;

        info!("Starting step '{}' ({})", step.id, step.capability);

        let mut result = self.dispatch(workflow, &step).await;
        let finished = Instant::now();
        result.duration_secs = finished.duration_since(started).as_secs_f64();

        record_outcome(workflow, &step.id, &result).await;

        if result.success {
            info!(
                "Step '{}' completed in {:.2}s ({} attempt(s))",
                step.id, result.duration_secs, result.attempts
            );
        } else {
            error!(
                "Step '{}' failed: {}",
                step.id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        if let Some(monitor) = &self.monitor {
            let mut update = MetricsUpdate::default()
                .with_response_time(result.duration_secs)
                .with_step_timing(&step.id, result.duration_secs);
            if let Some(kind) = &result.error_kind {
                update = update.with_error(kind);
            }
            monitor.track(&workflow_id, update).await;
        }

        StepRun {
            step_id: step.id,
            result,
            started,
            finished,
        }
    }

    async fn dispatch(&self, workflow: &SharedWorkflow, step: &Step) -> StepResult {
        let Some(worker) = self.cache.resolve(&step.capability).await else {
            return StepResult::unrouted(&StepError::WorkerNotFound {
                capability: step.capability.clone(),
            });
        };

        let agent = worker.agent_id().to_string();
        {
            let mut wf = workflow.lock().await;
            if let Some(s) = wf.get_step_mut(&step.id) {
                s.assigned_agent = Some(agent.clone());
            }
        }
        debug!("Step '{}' assigned to worker '{}'", step.id, agent);

        let message = Message::workflow_step(&self.sender_id, &agent, step.parameters.clone());
        let outcome = dispatch_with_retry(worker.as_ref(), &message, &step.retry_policy).await;

        StepResult::from_outcome(outcome, &agent)
    }
}

/// Marks a step running. Returns the owning workflow's id.
async fn mark_running(workflow: &SharedWorkflow, step_id: &str) -> String {
    let mut wf = workflow.lock().await;
    if let Some(step) = wf.get_step_mut(step_id) {
        step.status = Status::Running;
        step.start_time = Some(Utc::now());
        step.end_time = None;
        step.error = None;
    }
    wf.touch();
    wf.id.clone()
}

/// Writes a step outcome back by id. A step removed mid-run is ignored.
async fn record_outcome(workflow: &SharedWorkflow, step_id: &str, result: &StepResult) {
    let mut wf = workflow.lock().await;
    if let Some(step) = wf.get_step_mut(step_id) {
        step.status = if result.success {
            Status::Completed
        } else {
            Status::Failed
        };
        step.error = result.error.clone();
        step.end_time = Some(Utc::now());
    } else {
        debug!("Step '{}' no longer exists, dropping its outcome", step_id);
    }
    wf.touch();
}

/// Marks a step skipped without dispatching it.
pub async fn mark_skipped(workflow: &SharedWorkflow, step_id: &str) {
    let mut wf = workflow.lock().await;
    if let Some(step) = wf.get_step_mut(step_id) {
        step.status = Status::Skipped;
    }
    wf.touch();
}

/// Ends steps whose task stopped without a result.
///
/// Only steps still `running` are changed; steps that never started keep
/// their status.
pub async fn mark_interrupted(
    workflow: &SharedWorkflow,
    step_ids: &[String],
    status: Status,
    error: &str,
) {
    let mut wf = workflow.lock().await;
    let now = Utc::now();
    for step_id in step_ids {
        if let Some(step) = wf.get_step_mut(step_id) {
            if step.status == Status::Running {
                debug!("Step '{}' interrupted, marking {}", step_id, status);
                step.status = status;
                step.error = Some(error.to_string());
                step.end_time = Some(now);
            }
        }
    }
    wf.touch();
}
