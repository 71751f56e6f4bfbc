//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating orchestrated workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Step, Status, RetryPolicy)
//! - [`condition`]: Conditions gating conditional steps, and branches
//! - [`template`]: Reusable workflow skeletons
//! - [`parser`]: YAML loading
//! - [`validator`]: Validation rules and reference checking

pub mod condition;
pub mod model;
pub mod parser;
pub mod template;
pub mod validator;

pub use condition::{Condition, Predicate, WorkflowBranch};
pub use model::{ExecutionMode, RetryPolicy, RetryTrigger, Status, Step, Workflow};
pub use parser::{load_templates, load_workflow};
pub use template::{TemplateRegistry, TemplateStep, WorkflowTemplate};
pub use validator::{validate_workflow, ValidationError};
