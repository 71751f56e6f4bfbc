//! Workflow Metrics and Monitor
//!
//! [`Monitor`] keeps per-workflow metrics (state changes, response times,
//! error counts, resource and step timing samples), raises threshold
//! alerts into one global log, and answers summary and health queries.
//! It is shared behind an `Arc` and synchronizes internally.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::alerts::{Alert, AlertThresholds, AlertType};
use super::sink::{MetricsSink, NoopSink};

/// Samples kept per series; older ones are dropped.
const MAX_SAMPLES: usize = 1000;

/// Alerts kept in the global log.
const MAX_ALERTS: usize = 1000;

fn push_bounded(series: &mut Vec<f64>, value: f64) {
    if series.len() == MAX_SAMPLES {
        series.remove(0);
    }
    series.push(value);
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// One recorded state transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateChange {
    pub state: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Observations to merge into a workflow's metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    pub state: Option<String>,
    pub payload: Option<Value>,
    /// Seconds
    pub response_time: Option<f64>,
    /// Error kinds, one count each
    pub errors: Vec<String>,
    /// `(resource, percent)` samples
    pub resources: Vec<(String, f64)>,
    /// `(step id, seconds)`
    pub step_timing: Option<(String, f64)>,
}

impl MetricsUpdate {
    /// An update recording a state change.
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_response_time(mut self, secs: f64) -> Self {
        self.response_time = Some(secs);
        self
    }

    pub fn with_error(mut self, kind: impl Into<String>) -> Self {
        self.errors.push(kind.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>, percent: f64) -> Self {
        self.resources.push((resource.into(), percent));
        self
    }

    pub fn with_step_timing(mut self, step_id: impl Into<String>, secs: f64) -> Self {
        self.step_timing = Some((step_id.into(), secs));
        self
    }
}

/// Everything recorded for one workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub state_changes: Vec<StateChange>,
    /// Most recent response samples
    pub response_times: Vec<f64>,
    /// Response samples ever recorded
    pub response_count: u64,
    pub errors: BTreeMap<String, u64>,
    pub resources: BTreeMap<String, Vec<f64>>,
    pub step_timings: BTreeMap<String, Vec<f64>>,
    pub last_updated: DateTime<Utc>,
}

impl WorkflowMetrics {
    pub fn new(workflow_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            state_changes: Vec::new(),
            response_times: Vec::new(),
            response_count: 0,
            errors: BTreeMap::new(),
            resources: BTreeMap::new(),
            step_timings: BTreeMap::new(),
            last_updated: now,
        }
    }

    /// Merges an update and stamps `last_updated`.
    pub fn apply(&mut self, update: &MetricsUpdate, now: DateTime<Utc>) {
        if let Some(state) = &update.state {
            self.state_changes.push(StateChange {
                state: state.clone(),
                timestamp: now,
                payload: update.payload.clone(),
            });
        }
        if let Some(secs) = update.response_time {
            push_bounded(&mut self.response_times, secs);
            self.response_count += 1;
        }
        for kind in &update.errors {
            *self.errors.entry(kind.clone()).or_insert(0) += 1;
        }
        for (resource, value) in &update.resources {
            push_bounded(self.resources.entry(resource.clone()).or_default(), *value);
        }
        if let Some((step_id, secs)) = &update.step_timing {
            push_bounded(self.step_timings.entry(step_id.clone()).or_default(), *secs);
        }
        self.last_updated = now;
    }

    pub fn current_state(&self) -> Option<&str> {
        self.state_changes.last().map(|c| c.state.as_str())
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Errors per response sample; 1.0 when errors exist without samples.
    pub fn error_rate(&self) -> f64 {
        let errors = self.total_errors();
        if errors == 0 {
            0.0
        } else if self.response_count == 0 {
            1.0
        } else {
            errors as f64 / self.response_count as f64
        }
    }

    pub fn mean_response_time(&self) -> Option<f64> {
        mean(&self.response_times)
    }
}

/// Rolled-up timing of one step across samples.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepTimingSummary {
    pub samples: usize,
    pub mean_secs: f64,
    pub max_secs: f64,
}

/// Per-workflow rollup returned by [`Monitor::workflow_summary`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub current_state: Option<String>,
    pub state_changes: usize,
    pub response_samples: u64,
    pub mean_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub total_errors: u64,
    pub errors: BTreeMap<String, u64>,
    pub step_timings: BTreeMap<String, StepTimingSummary>,
    /// Latest sample per resource
    pub resources: BTreeMap<String, f64>,
    pub active_alerts: usize,
    pub last_updated: DateTime<Utc>,
}

/// System-wide rollup returned by [`Monitor::summary`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MonitorSummary {
    pub total_workflows: usize,
    /// Workflow count by last known state
    pub by_state: BTreeMap<String, usize>,
    pub total_errors: u64,
    pub mean_response_time: Option<f64>,
    pub active_alerts: usize,
    pub alerts_by_type: BTreeMap<String, usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub summary: MonitorSummary,
}

#[derive(Default)]
struct MonitorState {
    workflows: HashMap<String, WorkflowMetrics>,
    alerts: Vec<Alert>,
}

impl MonitorState {
    /// Appends an alert for one violation and returns it.
    fn raise(
        &mut self,
        workflow_id: &str,
        alert_type: AlertType,
        message: String,
        now: DateTime<Utc>,
    ) -> Alert {
        warn!("Alert {} on '{}': {}", alert_type.as_str(), workflow_id, message);
        let alert = Alert::new(workflow_id, alert_type, message, now);
        self.alerts.push(alert.clone());
        self.prune_alerts();
        alert
    }

    /// Keeps the log at `MAX_ALERTS`, dropping the oldest resolved alert
    /// first and the oldest alert when none is resolved.
    fn prune_alerts(&mut self) {
        while self.alerts.len() > MAX_ALERTS {
            let index = self
                .alerts
                .iter()
                .position(|a| !a.is_active())
                .unwrap_or(0);
            self.alerts.remove(index);
        }
    }
}

/// Observes workflows and raises threshold alerts.
pub struct Monitor {
    thresholds: AlertThresholds,
    sink: Arc<dyn MetricsSink>,
    state: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::with_thresholds(AlertThresholds::default())
    }

    pub fn with_thresholds(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            sink: Arc::new(NoopSink),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Merges `update` into the workflow's metrics and checks thresholds.
    ///
    /// Returns the alerts this update raised.
    pub async fn track(&self, workflow_id: &str, update: MetricsUpdate) -> Vec<Alert> {
        self.track_at(workflow_id, update, Utc::now()).await
    }

    /// [`track`](Self::track) with an explicit clock reading.
    pub async fn track_at(
        &self,
        workflow_id: &str,
        update: MetricsUpdate,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        self.export(workflow_id, &update);

        let mut state = self.state.lock().await;
        let metrics = state
            .workflows
            .entry(workflow_id.to_string())
            .or_insert_with(|| WorkflowMetrics::new(workflow_id, now));
        metrics.apply(&update, now);
        let violations = self.thresholds.evaluate(metrics, &update);

        if let Some(new_state) = &update.state {
            debug!("Workflow '{}' is now {}", workflow_id, new_state);
        }

        let mut raised = Vec::new();
        for (alert_type, message) in violations {
            self.sink
                .counter("alerts_total", 1, &[("type", alert_type.as_str())]);
            raised.push(state.raise(workflow_id, alert_type, message, now));
        }
        raised
    }

    fn export(&self, workflow_id: &str, update: &MetricsUpdate) {
        let labels = [("workflow", workflow_id)];
        if let Some(secs) = update.response_time {
            self.sink.histogram("response_time_seconds", secs, &labels);
        }
        for kind in &update.errors {
            self.sink.counter(
                "errors_total",
                1,
                &[("workflow", workflow_id), ("kind", kind.as_str())],
            );
        }
        for (resource, value) in &update.resources {
            self.sink.gauge(
                "resource_usage_percent",
                *value,
                &[("workflow", workflow_id), ("resource", resource.as_str())],
            );
        }
        if let Some((step_id, secs)) = &update.step_timing {
            self.sink.histogram(
                "step_duration_seconds",
                *secs,
                &[("workflow", workflow_id), ("step", step_id.as_str())],
            );
        }
    }

    /// Raises `stuck_workflow` for running workflows gone quiet.
    pub async fn check_stuck(&self) -> Vec<Alert> {
        self.check_stuck_at(Utc::now()).await
    }

    pub async fn check_stuck_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut state = self.state.lock().await;

        let stuck: Vec<(String, String)> = state
            .workflows
            .values()
            .filter_map(|m| {
                self.thresholds
                    .stuck(m, now)
                    .map(|message| (m.workflow_id.clone(), message))
            })
            .collect();

        stuck
            .into_iter()
            .map(|(id, message)| state.raise(&id, AlertType::StuckWorkflow, message, now))
            .collect()
    }

    pub async fn metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.state.lock().await.workflows.get(workflow_id).cloned()
    }

    /// Alerts in raise order, optionally for one workflow.
    pub async fn alerts(&self, workflow_id: Option<&str>) -> Vec<Alert> {
        let state = self.state.lock().await;
        state
            .alerts
            .iter()
            .filter(|a| workflow_id.map_or(true, |id| a.workflow_id == id))
            .cloned()
            .collect()
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let state = self.state.lock().await;
        state.alerts.iter().filter(|a| a.is_active()).cloned().collect()
    }

    /// Marks an alert resolved. Returns false for unknown or resolved ids.
    pub async fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id && a.is_active())
        {
            Some(alert) => {
                alert.resolve(Utc::now());
                info!("Resolved alert {} ({})", alert.id, alert.alert_type.as_str());
                true
            }
            None => false,
        }
    }

    pub async fn summary(&self) -> MonitorSummary {
        let state = self.state.lock().await;
        summarize(&state)
    }

    /// Healthy with no active alerts; unhealthy when a critical alert is
    /// active; degraded otherwise.
    pub async fn health(&self) -> HealthReport {
        let state = self.state.lock().await;
        let active: Vec<&Alert> = state.alerts.iter().filter(|a| a.is_active()).collect();

        let status = if active.is_empty() {
            HealthStatus::Healthy
        } else if active.iter().any(|a| a.alert_type.is_critical()) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            checked_at: Utc::now(),
            summary: summarize(&state),
        }
    }

    pub async fn workflow_summary(&self, workflow_id: &str) -> Option<WorkflowSummary> {
        let state = self.state.lock().await;
        let metrics = state.workflows.get(workflow_id)?;

        let step_timings = metrics
            .step_timings
            .iter()
            .filter_map(|(step_id, samples)| {
                let mean_secs = mean(samples)?;
                let max_secs = samples.iter().copied().fold(f64::MIN, f64::max);
                Some((
                    step_id.clone(),
                    StepTimingSummary {
                        samples: samples.len(),
                        mean_secs,
                        max_secs,
                    },
                ))
            })
            .collect();

        let resources = metrics
            .resources
            .iter()
            .filter_map(|(name, samples)| samples.last().map(|v| (name.clone(), *v)))
            .collect();

        Some(WorkflowSummary {
            workflow_id: workflow_id.to_string(),
            current_state: metrics.current_state().map(str::to_string),
            state_changes: metrics.state_changes.len(),
            response_samples: metrics.response_count,
            mean_response_time: metrics.mean_response_time(),
            max_response_time: metrics.response_times.iter().copied().reduce(f64::max),
            total_errors: metrics.total_errors(),
            errors: metrics.errors.clone(),
            step_timings,
            resources,
            active_alerts: state
                .alerts
                .iter()
                .filter(|a| a.is_active() && a.workflow_id == workflow_id)
                .count(),
            last_updated: metrics.last_updated,
        })
    }

    /// Drops metrics and alerts for one workflow, or for all.
    pub async fn clear(&self, workflow_id: Option<&str>) {
        let mut state = self.state.lock().await;
        match workflow_id {
            Some(id) => {
                state.workflows.remove(id);
                state.alerts.retain(|a| a.workflow_id != id);
            }
            None => {
                state.workflows.clear();
                state.alerts.clear();
            }
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(state: &MonitorState) -> MonitorSummary {
    let mut summary = MonitorSummary {
        total_workflows: state.workflows.len(),
        ..MonitorSummary::default()
    };

    let mut response_times = Vec::new();
    for metrics in state.workflows.values() {
        let label = metrics.current_state().unwrap_or("unknown").to_string();
        *summary.by_state.entry(label).or_insert(0) += 1;
        summary.total_errors += metrics.total_errors();
        response_times.extend_from_slice(&metrics.response_times);
    }
    summary.mean_response_time = mean(&response_times);

    for alert in state.alerts.iter().filter(|a| a.is_active()) {
        summary.active_alerts += 1;
        *summary
            .alerts_by_type
            .entry(alert.alert_type.as_str().to_string())
            .or_insert(0) += 1;
    }

    summary
}
