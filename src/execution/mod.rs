//! Workflow Execution Module
//!
//! Provides the orchestration engine that runs workflow steps against
//! capability-matched workers, including bucketed scheduling, bounded
//! retry, transactional rollback and run analytics.
//!
//! # Architecture
//!
//! - [`engine`]: Main engine orchestrating workflow runs and the workflow catalog
//! - [`step`]: Single step dispatch and result recording
//! - [`retry`]: Bounded-attempt dispatch with exponential backoff
//! - [`transaction`]: Snapshot/rollback guard around a workflow
//! - [`analytics`]: Status counts, completion times and parallel efficiency

pub mod analytics;
pub mod engine;
pub mod retry;
pub mod step;
pub mod transaction;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::workflow::Status;

pub use analytics::{ParallelTrace, WorkflowAnalytics};
pub use engine::{Engine, SharedWorkflow, StepPatch};
pub use step::StepResult;
pub use transaction::TransactionGuard;

/// Outcome of one workflow run.
///
/// Returned for every run that reaches the engine, including failed ones.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub workflow_id: String,
    pub status: Status,
    /// Steps that were dispatched (skipped and halted steps excluded)
    pub steps_executed: usize,
    pub step_results: HashMap<String, StepResult>,
    /// Wall-clock run time in seconds
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.status == Status::Completed
    }

    /// Ids of dispatched steps that did not succeed, sorted.
    pub fn failed_steps(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = self
            .step_results
            .iter()
            .filter(|(_, result)| !result.success)
            .map(|(id, _)| id.as_str())
            .collect();
        failed.sort_unstable();
        failed
    }
}
