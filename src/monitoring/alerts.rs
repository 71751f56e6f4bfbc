//! Threshold Alerts
//!
//! Alert records and the thresholds that raise them. Every threshold is
//! exclusive: a value equal to the limit does not alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::{MetricsUpdate, WorkflowMetrics};
use super::resource::{RESOURCE_CPU, RESOURCE_MEMORY};

/// Condition an alert reports.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighResponseTime,
    HighErrorRate,
    HighCpuUsage,
    HighMemoryUsage,
    StuckWorkflow,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighResponseTime => "high_response_time",
            Self::HighErrorRate => "high_error_rate",
            Self::HighCpuUsage => "high_cpu_usage",
            Self::HighMemoryUsage => "high_memory_usage",
            Self::StuckWorkflow => "stuck_workflow",
        }
    }

    /// Whether an active alert of this type makes the system unhealthy
    /// rather than degraded.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::HighErrorRate | Self::StuckWorkflow)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// A raised alert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: String,
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        workflow_id: impl Into<String>,
        alert_type: AlertType,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            alert_type,
            message: message.into(),
            timestamp,
            status: AlertStatus::Active,
            resolved_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
    }
}

/// Limits above which the monitor raises alerts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    /// Seconds per response sample
    pub response_time_secs: f64,
    /// Errors per response sample, as a fraction
    pub error_rate: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Seconds a running workflow may go without an update
    pub stuck_after_secs: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_secs: 1.0,
            error_rate: 0.01,
            cpu_percent: 80.0,
            memory_percent: 80.0,
            stuck_after_secs: 3600,
        }
    }
}

impl AlertThresholds {
    /// Configuration problems, empty when the thresholds are usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let checks = [
            ("monitor.response_time_secs", self.response_time_secs),
            ("monitor.error_rate", self.error_rate),
            ("monitor.cpu_percent", self.cpu_percent),
            ("monitor.memory_percent", self.memory_percent),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("{} must be a non-negative number", name));
            }
        }
        problems
    }

    /// Violations caused by `update`, after it was merged into `metrics`.
    pub fn evaluate(
        &self,
        metrics: &WorkflowMetrics,
        update: &MetricsUpdate,
    ) -> Vec<(AlertType, String)> {
        let mut violations = Vec::new();

        if let Some(secs) = update.response_time {
            if secs > self.response_time_secs {
                violations.push((
                    AlertType::HighResponseTime,
                    format!(
                        "Response time {:.2}s exceeds {:.2}s",
                        secs, self.response_time_secs
                    ),
                ));
            }
        }

        let sampled = update.response_time.is_some() || !update.errors.is_empty();
        if sampled && metrics.total_errors() > 0 {
            let rate = metrics.error_rate();
            if rate > self.error_rate {
                violations.push((
                    AlertType::HighErrorRate,
                    format!(
                        "Error rate {:.1}% exceeds {:.1}%",
                        rate * 100.0,
                        self.error_rate * 100.0
                    ),
                ));
            }
        }

        for (resource, value) in &update.resources {
            let (alert_type, limit) = match resource.as_str() {
                RESOURCE_CPU => (AlertType::HighCpuUsage, self.cpu_percent),
                RESOURCE_MEMORY => (AlertType::HighMemoryUsage, self.memory_percent),
                _ => continue,
            };
            if *value > limit {
                violations.push((
                    alert_type,
                    format!("{} usage {:.1}% exceeds {:.1}%", resource, value, limit),
                ));
            }
        }

        violations
    }

    /// Message for a workflow stuck in a running state, if it is.
    pub fn stuck(&self, metrics: &WorkflowMetrics, now: DateTime<Utc>) -> Option<String> {
        let state = metrics.current_state()?;
        if !matches!(state, "running" | "executing") {
            return None;
        }

        let idle = (now - metrics.last_updated).num_seconds();
        if idle > self.stuck_after_secs as i64 {
            Some(format!(
                "Workflow has been '{}' without updates for {}s",
                state, idle
            ))
        } else {
            None
        }
    }
}
