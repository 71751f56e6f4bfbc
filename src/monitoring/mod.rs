//! Monitoring Module
//!
//! Observes workflow runs: per-workflow metrics, threshold alerts, process
//! resource sampling and per-run step timelines.
//!
//! # Components
//!
//! - [`Monitor`]: Metrics aggregation, alerts, summaries and health
//! - [`AlertThresholds`]: Limits that raise alerts
//! - [`MetricsSink`]: Export hook for a metrics backend
//! - [`ResourceSampler`]: CPU and memory usage of this process
//! - [`ExecutionTimeline`]: Step start/end timing within a run

pub mod alerts;
pub mod metrics;
pub mod resource;
pub mod sink;
pub mod timeline;

pub use alerts::{Alert, AlertStatus, AlertThresholds, AlertType};
pub use metrics::{
    HealthReport, HealthStatus, MetricsUpdate, Monitor, MonitorSummary, StateChange,
    StepTimingSummary, WorkflowMetrics, WorkflowSummary,
};
pub use resource::{ResourceSample, ResourceSampler};
pub use sink::{LogSink, MetricsSink, NoopSink};
pub use timeline::ExecutionTimeline;
