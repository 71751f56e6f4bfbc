//! Conductor - Capability-Routed Workflow Orchestration
//!
//! Runs multi-step workflows whose steps are dispatched to workers chosen by
//! the capabilities they advertise. Steps run sequentially, in concurrent
//! parallel groups, or behind conditions on earlier results, with bounded
//! retries, transactional rollback and versioned persistence.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow and step definitions, templates, YAML parsing
//! - [`registry`]: Worker traits and the capability cache used for routing
//! - [`execution`]: Engine, retrying dispatch, transactions and analytics
//! - [`persistence`]: Versioned workflow store with a tagged JSON codec
//! - [`monitoring`]: Metrics, threshold alerts, resource sampling, timelines
//! - [`config`], [`error`], [`logging`]: Ambient configuration and errors
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use conductor::registry::{StaticRegistry, Worker};
//! use conductor::{load_workflow, Engine};
//!
//! # async fn run(workers: Vec<Arc<dyn Worker>>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = Engine::new(Arc::new(StaticRegistry::new(workers)));
//! engine.set_max_parallel(4);
//!
//! let id = engine.register(load_workflow("research.yaml")?).await;
//! let summary = engine.execute_workflow(&id).await?;
//! println!("{} finished as {}", id, summary.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod monitoring;
pub mod persistence;
pub mod registry;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, EngineConfig, FailurePolicy};
pub use error::{EngineError, PersistenceError, StepError};
pub use execution::{Engine, ExecutionSummary, StepResult};
pub use monitoring::Monitor;
pub use persistence::WorkflowStore;
pub use workflow::model::{Status, Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
