//! Transaction Guard
//!
//! Captures the run state of a workflow (its status, error and `updated_at`,
//! plus each step's status, agent, error and timestamps) so a failed run can
//! be rewound. Step state is restored by position; when the step count
//! changed, only the overlapping prefix is restored.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::Mutex;

use crate::workflow::{Status, Workflow};

use super::engine::SharedWorkflow;

#[derive(Debug, Clone, PartialEq)]
struct StepSnapshot {
    status: Status,
    assigned_agent: Option<String>,
    error: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    status: Status,
    error: Option<String>,
    updated_at: DateTime<Utc>,
    steps: Vec<StepSnapshot>,
}

impl Snapshot {
    fn capture(workflow: &Workflow) -> Self {
        Self {
            status: workflow.status,
            error: workflow.error.clone(),
            updated_at: workflow.updated_at,
            steps: workflow
                .steps
                .iter()
                .map(|step| StepSnapshot {
                    status: step.status,
                    assigned_agent: step.assigned_agent.clone(),
                    error: step.error.clone(),
                    start_time: step.start_time,
                    end_time: step.end_time,
                })
                .collect(),
        }
    }

    fn restore(&self, workflow: &mut Workflow) {
        workflow.status = self.status;
        workflow.error = self.error.clone();
        // Rollback is the one place updated_at may move backwards.
        workflow.updated_at = self.updated_at;

        for (step, saved) in workflow.steps.iter_mut().zip(&self.steps) {
            step.status = saved.status;
            step.assigned_agent = saved.assigned_agent.clone();
            step.error = saved.error.clone();
            step.start_time = saved.start_time;
            step.end_time = saved.end_time;
        }
    }
}

/// Snapshot/rollback guard over a shared workflow.
pub struct TransactionGuard {
    workflow: SharedWorkflow,
    baseline: Mutex<Snapshot>,
}

impl TransactionGuard {
    /// Captures the current state as the rollback point.
    pub async fn begin(workflow: SharedWorkflow) -> Self {
        let baseline = Snapshot::capture(&*workflow.lock().await);
        Self {
            workflow,
            baseline: Mutex::new(baseline),
        }
    }

    /// Makes the current state the new rollback point.
    pub async fn commit(&self) {
        let mut baseline = self.baseline.lock().await;
        let wf = self.workflow.lock().await;
        *baseline = Snapshot::capture(&wf);
        debug!("Committed transaction for workflow '{}'", wf.id);
    }

    /// Restores the workflow to the rollback point.
    pub async fn rollback(&self) {
        let baseline = self.baseline.lock().await;
        let mut wf = self.workflow.lock().await;
        baseline.restore(&mut wf);
        info!("Rolled back workflow '{}' to status {}", wf.id, wf.status);
    }

    /// Runs `f`, committing on `Ok` and rolling back on `Err`.
    ///
    /// The error from `f` is returned unchanged after the rollback.
    pub async fn scope<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match f().await {
            Ok(value) => {
                self.commit().await;
                Ok(value)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    pub fn workflow(&self) -> SharedWorkflow {
        Arc::clone(&self.workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;

    fn shared() -> SharedWorkflow {
        let mut workflow = Workflow::from_steps("tx", vec![Step::new("a", "x"), Step::new("b", "x")]);
        workflow.steps[0].status = Status::Completed;
        workflow.steps[0].assigned_agent = Some("w1".to_string());
        workflow.steps[0].start_time = Some(Utc::now());
        workflow.steps[0].end_time = Some(Utc::now());
        Arc::new(Mutex::new(workflow))
    }

    fn mutate(workflow: &mut Workflow) {
        workflow.status = Status::Failed;
        workflow.error = Some("boom".to_string());
        workflow.updated_at = Utc::now() + chrono::Duration::seconds(30);
        for step in &mut workflow.steps {
            step.status = Status::Failed;
            step.assigned_agent = Some("w9".to_string());
            step.error = Some("boom".to_string());
            step.start_time = None;
            step.end_time = Some(Utc::now());
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_exact_snapshot() {
        let workflow = shared();
        let before = workflow.lock().await.clone();
        let guard = TransactionGuard::begin(workflow.clone()).await;

        mutate(&mut *workflow.lock().await);
        guard.rollback().await;

        let after = workflow.lock().await.clone();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_commit_moves_rollback_point() {
        let workflow = shared();
        let guard = TransactionGuard::begin(workflow.clone()).await;

        workflow.lock().await.steps[1].status = Status::Completed;
        guard.commit().await;
        mutate(&mut *workflow.lock().await);
        guard.rollback().await;

        let wf = workflow.lock().await;
        assert_eq!(wf.steps[1].status, Status::Completed);
        assert!(wf.error.is_none());
    }

    #[tokio::test]
    async fn test_rollback_with_added_step() {
        let workflow = shared();
        let guard = TransactionGuard::begin(workflow.clone()).await;

        {
            let mut wf = workflow.lock().await;
            wf.add_step(Step::new("c", "x")).unwrap();
            wf.steps[2].status = Status::Running;
            wf.steps[1].status = Status::Failed;
        }
        guard.rollback().await;

        let wf = workflow.lock().await;
        assert_eq!(wf.steps[1].status, Status::Pending);
        assert_eq!(wf.steps[2].status, Status::Running);
    }

    #[tokio::test]
    async fn test_scope_commits_on_ok() {
        let workflow = shared();
        let guard = TransactionGuard::begin(workflow.clone()).await;

        let handle = workflow.clone();
        let result: Result<u32, String> = guard
            .scope(move || async move {
                handle.lock().await.status = Status::Completed;
                Ok(7)
            })
            .await;

        assert_eq!(result, Ok(7));
        guard.rollback().await;
        assert_eq!(workflow.lock().await.status, Status::Completed);
    }

    #[tokio::test]
    async fn test_scope_rolls_back_on_err() {
        let workflow = shared();
        let guard = TransactionGuard::begin(workflow.clone()).await;

        let handle = workflow.clone();
        let result: Result<(), String> = guard
            .scope(move || async move {
                mutate(&mut *handle.lock().await);
                Err("step exploded".to_string())
            })
            .await;

        assert_eq!(result, Err("step exploded".to_string()));
        let wf = workflow.lock().await;
        assert_eq!(wf.status, Status::Created);
        assert_eq!(wf.steps[0].assigned_agent.as_deref(), Some("w1"));
        assert!(wf.steps[1].error.is_none());
    }
}
