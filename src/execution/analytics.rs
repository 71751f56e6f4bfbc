//! Workflow Analytics
//!
//! Aggregates over the engine's catalog: workflow counts by status, mean
//! completion time of completed workflows, and parallel efficiency from
//! traces recorded while parallel groups ran.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::workflow::{Status, Workflow};

/// Traces kept for the efficiency average; older ones are dropped.
const MAX_TRACES: usize = 1024;

/// Timing of one parallel group execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParallelTrace {
    pub workflow_id: String,
    pub group: String,
    pub members: usize,
    /// Member busy time over `members * group wall time`, in [0, 1]
    pub efficiency: f64,
}

/// Snapshot returned by [`Engine::analytics`](super::Engine::analytics).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowAnalytics {
    pub total_workflows: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Mean run time of the last completed run per workflow
    pub mean_completion_secs: Option<f64>,
    /// Mean over recorded parallel traces; `None` if none were recorded
    pub parallel_efficiency: Option<f64>,
    pub parallel_groups_observed: usize,
}

/// Run observations accumulated by the engine.
#[derive(Debug, Default)]
pub struct RunHistory {
    traces: VecDeque<ParallelTrace>,
    completion_secs: HashMap<String, f64>,
}

impl RunHistory {
    pub fn record_trace(&mut self, trace: ParallelTrace) {
        if self.traces.len() == MAX_TRACES {
            self.traces.pop_front();
        }
        self.traces.push_back(trace);
    }

    /// Records a finished run; only completed runs count toward the mean.
    pub fn record_run(&mut self, workflow_id: &str, status: Status, secs: f64) {
        if status == Status::Completed {
            self.completion_secs.insert(workflow_id.to_string(), secs);
        } else {
            self.completion_secs.remove(workflow_id);
        }
    }

    pub fn forget(&mut self, workflow_id: &str) {
        self.completion_secs.remove(workflow_id);
        self.traces.retain(|t| t.workflow_id != workflow_id);
    }

    pub fn traces(&self) -> impl Iterator<Item = &ParallelTrace> {
        self.traces.iter()
    }
}

/// Computes analytics over `workflows` and the recorded history.
pub fn compute<'a>(
    workflows: impl IntoIterator<Item = &'a Workflow>,
    history: &RunHistory,
) -> WorkflowAnalytics {
    let mut analytics = WorkflowAnalytics::default();
    let mut completion = Vec::new();

    for workflow in workflows {
        analytics.total_workflows += 1;
        *analytics
            .by_status
            .entry(workflow.status.as_str().to_string())
            .or_insert(0) += 1;

        if workflow.status == Status::Completed {
            if let Some(secs) = history.completion_secs.get(&workflow.id) {
                completion.push(*secs);
            }
        }
    }

    analytics.mean_completion_secs = mean(&completion);

    let efficiencies: Vec<f64> = history.traces.iter().map(|t| t.efficiency).collect();
    analytics.parallel_groups_observed = efficiencies.len();
    analytics.parallel_efficiency = mean(&efficiencies);

    analytics
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(id: &str, status: Status) -> Workflow {
        let mut workflow = Workflow::new(id).with_id(id);
        workflow.status = status;
        workflow
    }

    fn trace(workflow_id: &str, efficiency: f64) -> ParallelTrace {
        ParallelTrace {
            workflow_id: workflow_id.to_string(),
            group: "g".to_string(),
            members: 2,
            efficiency,
        }
    }

    #[test]
    fn test_empty_analytics() {
        let analytics = compute(Vec::<&Workflow>::new(), &RunHistory::default());
        assert_eq!(analytics.total_workflows, 0);
        assert!(analytics.mean_completion_secs.is_none());
        assert!(analytics.parallel_efficiency.is_none());
    }

    #[test]
    fn test_status_counts_and_completion_mean() {
        let workflows = vec![
            workflow("a", Status::Completed),
            workflow("b", Status::Completed),
            workflow("c", Status::Failed),
            workflow("d", Status::Created),
        ];
        let mut history = RunHistory::default();
        history.record_run("a", Status::Completed, 2.0);
        history.record_run("b", Status::Completed, 4.0);
        history.record_run("c", Status::Failed, 9.0);

        let analytics = compute(&workflows, &history);

        assert_eq!(analytics.total_workflows, 4);
        assert_eq!(analytics.by_status["completed"], 2);
        assert_eq!(analytics.by_status["failed"], 1);
        assert_eq!(analytics.by_status["created"], 1);
        assert_eq!(analytics.mean_completion_secs, Some(3.0));
    }

    #[test]
    fn test_parallel_efficiency_mean() {
        let mut history = RunHistory::default();
        history.record_trace(trace("a", 0.5));
        history.record_trace(trace("a", 1.0));

        let analytics = compute(Vec::<&Workflow>::new(), &history);
        assert_eq!(analytics.parallel_groups_observed, 2);
        assert_eq!(analytics.parallel_efficiency, Some(0.75));

        history.forget("a");
        assert_eq!(history.traces().count(), 0);
    }

    #[test]
    fn test_failed_rerun_drops_completion_time() {
        let mut history = RunHistory::default();
        history.record_run("a", Status::Completed, 2.0);
        history.record_run("a", Status::Failed, 1.0);

        let analytics = compute(&[workflow("a", Status::Completed)], &history);
        assert!(analytics.mean_completion_secs.is_none());
    }
}
