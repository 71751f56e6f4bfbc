//! Workflow Execution Engine
//!
//! The core engine that orchestrates workflow runs including:
//! - Partitioning steps into sequential, parallel and conditional buckets
//! - Bounded parallel dispatch per group via a task set and semaphore
//! - Conditional gating against the run's result map
//! - A catalog of registered workflows that may be edited between runs
//! - Templates, analytics and transactional runs
//!
//! A run snapshots the step list when it starts. Steps added mid-run wait
//! for the next run; outcomes of steps removed mid-run are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::config::{EngineConfig, FailurePolicy};
use crate::error::EngineError;
use crate::monitoring::{resource, ExecutionTimeline, MetricsUpdate, Monitor};
use crate::persistence::WorkflowStore;
use crate::registry::{CapabilityCache, CapabilityRegistry};
use crate::workflow::condition::all_met;
use crate::workflow::model::derive_status;
use crate::workflow::{
    Condition, ExecutionMode, Predicate, RetryPolicy, Status, Step, TemplateRegistry, Workflow,
    WorkflowTemplate,
};

use super::analytics::{self, ParallelTrace, RunHistory, WorkflowAnalytics};
use super::step::{mark_interrupted, mark_skipped, StepDispatcher, StepResult, StepRun};
use super::transaction::TransactionGuard;
use super::ExecutionSummary;

/// A workflow shared between the catalog, in-flight step tasks and guards.
pub type SharedWorkflow = Arc<Mutex<Workflow>>;

/// Partial update of one step. `None` fields are left unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StepPatch {
    /// Step to update; ids themselves cannot be changed
    pub step_id: String,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub next_steps: Option<Vec<String>>,
}

impl StepPatch {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn in_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    fn apply(&self, step: &mut Step) {
        if let Some(capability) = &self.capability {
            step.capability = capability.trim().to_string();
        }
        if let Some(parameters) = &self.parameters {
            step.parameters = parameters.clone();
        }
        if let Some(mode) = self.execution_mode {
            step.execution_mode = mode;
        }
        if let Some(conditions) = &self.conditions {
            step.conditions = conditions.clone();
        }
        if let Some(group) = &self.parallel_group {
            step.parallel_group = Some(group.clone());
        }
        if let Some(policy) = &self.retry_policy {
            step.retry_policy = policy.clone();
        }
        if let Some(next) = &self.next_steps {
            step.next_steps = Some(next.clone());
        }
    }
}

/// Steps of one run, split by scheduling mode. Declared order is kept.
struct Buckets {
    sequential: Vec<Step>,
    parallel: Vec<(String, Vec<Step>)>,
    conditional: Vec<Step>,
}

impl Buckets {
    fn partition(steps: &[Step]) -> Self {
        let mut buckets = Self {
            sequential: Vec::new(),
            parallel: Vec::new(),
            conditional: Vec::new(),
        };

        for step in steps {
            match step.execution_mode {
                ExecutionMode::Sequential => buckets.sequential.push(step.clone()),
                ExecutionMode::Conditional => buckets.conditional.push(step.clone()),
                ExecutionMode::Parallel => {
                    let key = step.group_key();
                    match buckets.parallel.iter_mut().find(|(group, _)| group == key) {
                        Some((_, members)) => members.push(step.clone()),
                        None => buckets
                            .parallel
                            .push((key.to_string(), vec![step.clone()])),
                    }
                }
            }
        }

        buckets
    }
}

/// Ids of step tasks that were dropped before returning a result.
type Interrupted = Arc<std::sync::Mutex<Vec<String>>>;

/// Reports its step as interrupted when dropped while still armed.
///
/// A task future is dropped before its join error is delivered, so a
/// panicked step is reported by the time the panic is joined.
struct TaskGuard {
    step_id: Option<String>,
    interrupted: Interrupted,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(step_id) = self.step_id.take() {
            self.interrupted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(step_id);
        }
    }
}

/// Private state of one run.
struct Run {
    workflow_id: String,
    results: HashMap<String, StepResult>,
    tasks: JoinSet<StepRun>,
    permits: Arc<Semaphore>,
    interrupted: Interrupted,
    timeline: ExecutionTimeline,
    traces: Vec<ParallelTrace>,
}

impl Run {
    fn new(workflow_id: String, max_parallel: usize) -> Self {
        Self {
            workflow_id,
            results: HashMap::new(),
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            interrupted: Arc::default(),
            timeline: ExecutionTimeline::new(),
            traces: Vec::new(),
        }
    }

    fn record(&mut self, step_run: StepRun) {
        self.timeline.record_span(
            &step_run.step_id,
            step_run.started,
            step_run.finished,
            step_run.result.success,
        );
        self.results.insert(step_run.step_id, step_run.result);
    }

    fn take_interrupted(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .interrupted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Fails the steps whose tasks panicked and builds the run error.
    async fn task_failure(
        &self,
        workflow: &SharedWorkflow,
        label: &str,
        e: JoinError,
    ) -> EngineError {
        let message = e.to_string();
        let panicked = self.take_interrupted();
        mark_interrupted(
            workflow,
            &panicked,
            Status::Failed,
            &format!("step task failed: {}", message),
        )
        .await;
        EngineError::TaskFailed {
            step: label.to_string(),
            message,
        }
    }

    /// Aborts and awaits every task still in the set. Steps whose tasks
    /// were aborted mid-dispatch end as cancelled.
    async fn shutdown(&mut self, workflow: &SharedWorkflow) {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(step_run) => debug!(
                    "Step '{}' finished while the run was shutting down",
                    step_run.step_id
                ),
                Err(e) if e.is_cancelled() => debug!("Cancelled a leftover step task"),
                Err(e) => warn!("Leftover step task failed during shutdown: {}", e),
            }
        }

        let cancelled = self.take_interrupted();
        if !cancelled.is_empty() {
            info!(
                "Cancelled {} in-flight step(s) of '{}'",
                cancelled.len(),
                self.workflow_id
            );
            mark_interrupted(workflow, &cancelled, Status::Cancelled, "cancelled: run aborted")
                .await;
        }
    }
}

/// Workflow execution engine.
///
/// Routes every step to a worker resolved by capability, and keeps a
/// catalog of registered workflows.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use conductor::execution::Engine;
/// use conductor::registry::StaticRegistry;
/// use conductor::workflow::{Step, Workflow};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(StaticRegistry::default());
/// let engine = Engine::new(registry);
///
/// let id = engine
///     .register(Workflow::from_steps("research", vec![Step::new("fetch", "search")]))
///     .await;
/// let summary = engine.execute_workflow(&id).await?;
/// println!("{} finished {}", summary.workflow_id, summary.status);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: EngineConfig,
    dispatcher: StepDispatcher,
    monitor: Option<Arc<Monitor>>,
    store: Option<Arc<WorkflowStore>>,
    workflows: RwLock<HashMap<String, SharedWorkflow>>,
    templates: RwLock<TemplateRegistry>,
    predicates: RwLock<HashMap<String, Predicate>>,
    history: Mutex<RunHistory>,
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(registry: Arc<dyn CapabilityRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<dyn CapabilityRegistry>, config: EngineConfig) -> Self {
        let ttl = Duration::from_secs(config.capability_ttl_secs);
        let cache = Arc::new(CapabilityCache::with_ttl(registry, ttl));
        Self::with_cache(cache, config)
    }

    /// Creates an engine over an existing, possibly shared, capability cache.
    pub fn with_cache(cache: Arc<CapabilityCache>, config: EngineConfig) -> Self {
        let dispatcher = StepDispatcher::new(cache, config.sender_id.clone());
        Self {
            config,
            dispatcher,
            monitor: None,
            store: None,
            workflows: RwLock::new(HashMap::new()),
            templates: RwLock::new(TemplateRegistry::new()),
            predicates: RwLock::new(HashMap::new()),
            history: Mutex::new(RunHistory::default()),
        }
    }

    /// Reports step and workflow metrics to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.dispatcher.set_monitor(Arc::clone(&monitor));
        self.monitor = Some(monitor);
        self
    }

    /// Saves workflows to `store` after catalog runs.
    pub fn with_store(mut self, store: Arc<WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the maximum number of step dispatches in flight per run.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.config.max_parallel = max.max(1);
    }

    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.config.failure_policy = policy;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CapabilityCache> {
        self.dispatcher.cache()
    }

    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Runs an unregistered workflow in place.
    pub async fn execute(&self, workflow: &mut Workflow) -> ExecutionSummary {
        let shared: SharedWorkflow = Arc::new(Mutex::new(std::mem::take(workflow)));
        let summary = self.execute_shared(&shared).await;
        *workflow = shared.lock().await.clone();
        summary
    }

    /// Runs a shared workflow.
    ///
    /// Always returns a summary; step failures and task panics are reported
    /// through the final status and `error`.
    pub async fn execute_shared(&self, workflow: &SharedWorkflow) -> ExecutionSummary {
        let started = Instant::now();

        let (workflow_id, steps) = {
            let mut wf = workflow.lock().await;
            wf.status = Status::Running;
            wf.error = None;
            for step in &mut wf.steps {
                step.reset();
            }
            wf.touch();
            (wf.id.clone(), wf.steps.clone())
        };

        info!(
            "Starting workflow '{}' ({} steps, max parallel: {}, on failure: {:?})",
            workflow_id,
            steps.len(),
            self.config.max_parallel,
            self.config.failure_policy
        );
        self.report_state(&workflow_id, Status::Running).await;

        let sampler = self.start_resource_sampling(&workflow_id);
        let mut run = Run::new(workflow_id.clone(), self.config.max_parallel);

        let outcome = self.run_buckets(workflow, &steps, &mut run).await;
        run.shutdown(workflow).await;
        if let Some(handle) = sampler {
            handle.abort();
        }

        let run_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let (status, error) = {
            let mut wf = workflow.lock().await;
            match &outcome {
                Ok(()) => {
                    let status =
                        derive_status(wf.steps.iter().filter(|s| run_ids.contains(s.id.as_str())));
                    if status == Status::Failed {
                        let unfinished: Vec<&str> = wf
                            .steps
                            .iter()
                            .filter(|s| run_ids.contains(s.id.as_str()))
                            .filter(|s| !matches!(s.status, Status::Completed | Status::Skipped))
                            .map(|s| s.id.as_str())
                            .collect();
                        let message = format!("steps not completed: {}", unfinished.join(", "));
                        wf.error = Some(message);
                    }
                    wf.status = status;
                }
                Err(e) => {
                    error!("Workflow '{}' aborted: {}", workflow_id, e);
                    // Any step still running here lost its task
                    let now = Utc::now();
                    for step in wf
                        .steps
                        .iter_mut()
                        .filter(|s| run_ids.contains(s.id.as_str()))
                        .filter(|s| s.status == Status::Running)
                    {
                        step.status = Status::Failed;
                        step.error = Some(format!("run aborted: {}", e));
                        step.end_time = Some(now);
                    }
                    wf.status = Status::Failed;
                    wf.error = Some(e.to_string());
                }
            }
            wf.touch();
            (wf.status, wf.error.clone())
        };

        let execution_time = started.elapsed().as_secs_f64();
        {
            let mut history = self.history.lock().await;
            history.record_run(&workflow_id, status, execution_time);
            for trace in run.traces.drain(..) {
                history.record_trace(trace);
            }
        }
        self.report_state(&workflow_id, status).await;

        debug!("Timeline for '{}':\n{}", workflow_id, run.timeline.report());
        if status == Status::Completed {
            info!(
                "Workflow '{}' completed in {:.2}s",
                workflow_id, execution_time
            );
        } else {
            error!(
                "Workflow '{}' failed after {:.2}s: {}",
                workflow_id,
                execution_time,
                error.as_deref().unwrap_or("unknown error")
            );
        }

        ExecutionSummary {
            workflow_id,
            status,
            steps_executed: run.results.len(),
            step_results: run.results,
            execution_time,
            error,
        }
    }

    /// Runs a workflow, rolling it back if it does not complete.
    ///
    /// A rolled-back run is reported as [`EngineError::TransactionRollback`]
    /// carrying the run's summary.
    pub async fn execute_in_transaction(
        &self,
        workflow: &SharedWorkflow,
    ) -> Result<ExecutionSummary, EngineError> {
        let guard = TransactionGuard::begin(Arc::clone(workflow)).await;

        guard
            .scope(move || async move {
                let summary = self.execute_shared(workflow).await;
                if summary.is_success() {
                    return Ok(summary);
                }
                let reason = summary
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("workflow finished {}", summary.status));
                warn!(
                    "Rolling back workflow '{}': {}",
                    summary.workflow_id, reason
                );
                Err(EngineError::TransactionRollback {
                    workflow_id: summary.workflow_id.clone(),
                    reason,
                    summary: Box::new(summary),
                })
            })
            .await
    }

    async fn run_buckets(
        &self,
        workflow: &SharedWorkflow,
        steps: &[Step],
        run: &mut Run,
    ) -> Result<(), EngineError> {
        let buckets = Buckets::partition(steps);
        debug!(
            "Partitioned '{}': {} sequential, {} parallel group(s), {} conditional",
            run.workflow_id,
            buckets.sequential.len(),
            buckets.parallel.len(),
            buckets.conditional.len()
        );

        for step in &buckets.sequential {
            let succeeded = self.run_one(workflow, step, run).await?;
            if !succeeded && self.config.failure_policy == FailurePolicy::Halt {
                warn!(
                    "Step '{}' failed - halting remaining sequential steps",
                    step.id
                );
                break;
            }
        }

        for (group, members) in &buckets.parallel {
            self.run_group(workflow, group, members, run).await?;
        }

        for step in &buckets.conditional {
            let met = {
                let predicates = self.predicates.read().await;
                all_met(&step.conditions, &run.results, &predicates)
            };

            if met {
                self.run_one(workflow, step, run).await?;
            } else {
                info!("Skipping step '{}': conditions not met", step.id);
                mark_skipped(workflow, &step.id).await;
            }
        }

        Ok(())
    }

    /// Dispatches one step and waits for it. Returns whether it succeeded.
    async fn run_one(
        &self,
        workflow: &SharedWorkflow,
        step: &Step,
        run: &mut Run,
    ) -> Result<bool, EngineError> {
        self.spawn_step(workflow, step, run);

        match run.tasks.join_next().await {
            Some(Ok(step_run)) => {
                let succeeded = step_run.result.success;
                run.record(step_run);
                Ok(succeeded)
            }
            Some(Err(e)) => Err(run.task_failure(workflow, &step.id, e).await),
            None => Err(EngineError::TaskFailed {
                step: step.id.clone(),
                message: "step task was not scheduled".to_string(),
            }),
        }
    }

    /// Dispatches a parallel group and joins every member.
    async fn run_group(
        &self,
        workflow: &SharedWorkflow,
        group: &str,
        members: &[Step],
        run: &mut Run,
    ) -> Result<(), EngineError> {
        info!(
            "Running parallel group '{}' ({} steps)",
            group,
            members.len()
        );

        for step in members {
            self.spawn_step(workflow, step, run);
        }

        while let Some(joined) = run.tasks.join_next().await {
            match joined {
                Ok(step_run) => run.record(step_run),
                Err(e) if e.is_cancelled() => debug!("Step task in '{}' was cancelled", group),
                Err(e) => return Err(run.task_failure(workflow, group, e).await),
            }
        }

        let ids: Vec<&str> = members.iter().map(|s| s.id.as_str()).collect();
        if let Some(efficiency) = run.timeline.efficiency(&ids) {
            debug!("Group '{}' efficiency: {:.2}", group, efficiency);
            run.traces.push(ParallelTrace {
                workflow_id: run.workflow_id.clone(),
                group: group.to_string(),
                members: members.len(),
                efficiency,
            });
        }

        Ok(())
    }

    fn spawn_step(&self, workflow: &SharedWorkflow, step: &Step, run: &mut Run) {
        let dispatcher = self.dispatcher.clone();
        let workflow = Arc::clone(workflow);
        let permits = Arc::clone(&run.permits);
        let step = step.clone();
        let mut guard = TaskGuard {
            step_id: Some(step.id.clone()),
            interrupted: Arc::clone(&run.interrupted),
        };

        run.tasks.spawn(async move {
            // The semaphore is never closed; dispatch unthrottled if it were.
            let _permit = permits.acquire_owned().await.ok();
            let step_run = dispatcher.execute(&workflow, step).await;
            guard.step_id = None;
            step_run
        });
    }

    fn start_resource_sampling(&self, workflow_id: &str) -> Option<JoinHandle<()>> {
        let monitor = self.monitor.clone()?;
        if self.config.resource_sample_ms == 0 {
            return None;
        }
        Some(resource::spawn_sampler(
            monitor,
            workflow_id.to_string(),
            Duration::from_millis(self.config.resource_sample_ms),
        ))
    }

    async fn report_state(&self, workflow_id: &str, status: Status) {
        if let Some(monitor) = &self.monitor {
            monitor
                .track(workflow_id, MetricsUpdate::state(status.as_str()))
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Registers a workflow and returns its id. Replaces any workflow with
    /// the same id.
    pub async fn register(&self, workflow: Workflow) -> String {
        let id = workflow.id.clone();
        let mut workflows = self.workflows.write().await;
        if workflows
            .insert(id.clone(), Arc::new(Mutex::new(workflow)))
            .is_some()
        {
            warn!("Replaced registered workflow '{}'", id);
        } else {
            info!("Registered workflow '{}'", id);
        }
        id
    }

    /// Shared handle to a registered workflow.
    pub async fn handle(&self, id: &str) -> Option<SharedWorkflow> {
        self.workflows.read().await.get(id).cloned()
    }

    /// Snapshot of a registered workflow.
    pub async fn workflow(&self, id: &str) -> Option<Workflow> {
        let handle = self.handle(id).await?;
        let snapshot = handle.lock().await.clone();
        Some(snapshot)
    }

    /// Registered workflow ids, sorted.
    pub async fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes a workflow from the catalog, its saved state and its metrics.
    ///
    /// Returns whether anything was removed.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool, EngineError> {
        let removed = self.workflows.write().await.remove(id).is_some();
        self.history.lock().await.forget(id);
        if let Some(monitor) = &self.monitor {
            monitor.clear(Some(id)).await;
        }

        let deleted = match &self.store {
            Some(store) => store.delete(id).await?,
            None => false,
        };

        if removed || deleted {
            info!("Deleted workflow '{}'", id);
        }
        Ok(removed || deleted)
    }

    async fn require(&self, id: &str) -> Result<SharedWorkflow, EngineError> {
        self.handle(id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    /// Runs a registered workflow, then saves it when a store is attached.
    pub async fn execute_workflow(&self, id: &str) -> Result<ExecutionSummary, EngineError> {
        let handle = self.require(id).await?;
        let summary = self.execute_shared(&handle).await;

        if let Some(store) = &self.store {
            let snapshot = handle.lock().await.clone();
            store.save(&snapshot).await?;
        }

        Ok(summary)
    }

    /// Appends steps to a registered workflow.
    ///
    /// Fails without changing anything if any id is already taken.
    pub async fn add_steps(&self, id: &str, steps: Vec<Step>) -> Result<(), EngineError> {
        let handle = self.require(id).await?;
        let mut wf = handle.lock().await;

        let mut taken: HashSet<String> = wf.steps.iter().map(|s| s.id.clone()).collect();
        for step in &steps {
            if !taken.insert(step.id.clone()) {
                return Err(EngineError::DuplicateStep {
                    workflow: id.to_string(),
                    step: step.id.clone(),
                });
            }
        }

        let count = steps.len();
        for step in steps {
            let step_id = step.id.clone();
            wf.add_step(step).map_err(|_| EngineError::DuplicateStep {
                workflow: id.to_string(),
                step: step_id,
            })?;
        }

        info!("Added {} step(s) to workflow '{}'", count, id);
        Ok(())
    }

    /// Removes steps from a registered workflow and returns them.
    ///
    /// Fails without changing anything if any id is unknown.
    pub async fn remove_steps(&self, id: &str, step_ids: &[&str]) -> Result<Vec<Step>, EngineError> {
        let handle = self.require(id).await?;
        let mut wf = handle.lock().await;

        if let Some(missing) = step_ids.iter().find(|s| wf.get_step(s).is_none()) {
            return Err(EngineError::StepNotFound {
                workflow: id.to_string(),
                step: missing.to_string(),
            });
        }

        let mut removed = Vec::with_capacity(step_ids.len());
        for step_id in step_ids {
            // Repeated ids were removed by an earlier iteration.
            if let Ok(step) = wf.remove_step(step_id) {
                removed.push(step);
            }
        }

        info!("Removed {} step(s) from workflow '{}'", removed.len(), id);
        Ok(removed)
    }

    /// Applies patches to steps of a registered workflow.
    ///
    /// Fails without changing anything if any patch names an unknown step.
    pub async fn update_steps(&self, id: &str, patches: &[StepPatch]) -> Result<(), EngineError> {
        let handle = self.require(id).await?;
        let mut wf = handle.lock().await;

        if let Some(missing) = patches.iter().find(|p| wf.get_step(&p.step_id).is_none()) {
            return Err(EngineError::StepNotFound {
                workflow: id.to_string(),
                step: missing.step_id.clone(),
            });
        }

        for patch in patches {
            if let Some(step) = wf.get_step_mut(&patch.step_id) {
                patch.apply(step);
            }
        }
        wf.refresh_capabilities();
        wf.touch();

        info!("Updated {} step(s) in workflow '{}'", patches.len(), id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Templates, predicates, analytics
    // ------------------------------------------------------------------

    pub async fn register_template(&self, template: WorkflowTemplate) {
        let name = template.name.clone();
        if self.templates.write().await.register(template).is_some() {
            warn!("Replaced template '{}'", name);
        }
    }

    pub async fn template_names(&self) -> Vec<String> {
        self.templates.read().await.names()
    }

    /// Instantiates a template and registers the result. Returns its id.
    pub async fn instantiate_template(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<String, EngineError> {
        let workflow = {
            let templates = self.templates.read().await;
            let template = templates
                .get(name)
                .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))?;
            template.instantiate_with_retry(params, &self.config.default_retry)
        };
        Ok(self.register(workflow).await)
    }

    /// Registers a named predicate for `custom` conditions.
    pub async fn register_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&StepResult) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered predicate '{}'", name);
        self.predicates
            .write()
            .await
            .insert(name, Arc::new(predicate));
    }

    /// Aggregates over the catalog and recorded runs.
    pub async fn analytics(&self) -> WorkflowAnalytics {
        let handles: Vec<SharedWorkflow> = self.workflows.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.clone());
        }

        let history = self.history.lock().await;
        analytics::compute(&snapshots, &history)
    }
}
