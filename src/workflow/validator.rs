//! Workflow Validation
//!
//! Structural checks run on workflow definitions before they are handed to
//! the engine:
//! - Step field validation
//! - Duplicate id detection
//! - Reference integrity for successors and condition targets
//!
//! Scheduling oddities that the engine tolerates (a conditional step with no
//! conditions, a parallel step with no group) are logged as warnings.

use std::collections::HashSet;

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{ExecutionMode, Step, Workflow};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("Step '{0}' has no capability specified")]
    EmptyCapability(String),

    #[error("Step '{step}' references unknown step '{reference}'")]
    InvalidReference { step: String, reference: String },

    #[error("Step '{step}' has a condition targeting itself")]
    SelfReference { step: String },

    #[error("Step '{0}' has a retry backoff factor that is negative or not finite")]
    InvalidBackoff(String),
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    if step.capability.trim().is_empty() {
        errors.push(ValidationError::EmptyCapability(step.id.clone()));
    }

    match step.execution_mode {
        ExecutionMode::Conditional if step.conditions.is_empty() => {
            warn!(
                "Step '{}' is conditional but has no conditions - it will always run",
                step.id
            );
        }
        ExecutionMode::Parallel if step.parallel_group.is_none() => {
            warn!(
                "Step '{}' is parallel without a group - joining group '{}'",
                step.id,
                step.group_key()
            );
        }
        ExecutionMode::Sequential | ExecutionMode::Parallel
            if !step.conditions.is_empty() =>
        {
            warn!(
                "Step '{}' has conditions but runs {} - conditions are ignored",
                step.id,
                step.execution_mode.as_str()
            );
        }
        _ => {}
    }

    if step.conditions.iter().any(|c| c.target() == step.id) {
        errors.push(ValidationError::SelfReference {
            step: step.id.clone(),
        });
    }

    let backoff = step.retry_policy.backoff_factor;
    if !backoff.is_finite() || backoff < 0.0 {
        errors.push(ValidationError::InvalidBackoff(step.id.clone()));
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. No duplicate step IDs
/// 2. All steps have valid fields
/// 3. Successor ids and condition targets point to existing steps
///
/// All problems are collected and returned together.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), Vec<ValidationError>> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.name,
        workflow.steps.len()
    );

    if workflow.steps.is_empty() {
        warn!("Workflow '{}' has no steps", workflow.name);
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        errors.extend(validate_step(step));

        let successors = step.next_steps.iter().flatten().map(String::as_str);
        let targets = step.conditions.iter().map(|c| c.target());

        for reference in successors.chain(targets) {
            if !seen_ids.contains(reference) {
                errors.push(ValidationError::InvalidReference {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    debug!(
        "Workflow '{}' validated: capabilities {:?}",
        workflow.name, workflow.required_capabilities
    );
    Ok(())
}

/// Quick validation that returns a list of error messages.
pub fn quick_validate(workflow: &Workflow) -> Vec<String> {
    match validate_workflow(workflow) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    }
}
