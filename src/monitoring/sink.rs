//! Metrics Export
//!
//! The monitor mirrors what it records into a [`MetricsSink`] so a host can
//! forward it to a metrics backend. Every method defaults to a no-op.

use log::debug;

/// Destination for exported metrics.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}

    fn histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

/// Writes every metric to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        debug!("counter {} += {} {}", name, value, render(labels));
    }

    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        debug!("gauge {} = {:.3} {}", name, value, render(labels));
    }

    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        debug!("histogram {} <- {:.3} {}", name, value, render(labels));
    }
}

fn render(labels: &[(&str, &str)]) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", pairs.join(","))
}
