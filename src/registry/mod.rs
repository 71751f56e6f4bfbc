//! Worker Registry Interfaces
//!
//! Contracts for the external collaborators the engine routes work to:
//! the capability registry that enumerates workers, and the workers that
//! handle dispatched step messages.
//!
//! - [`capability`]: Capability descriptors and key normalization
//! - [`cache`]: Time-bounded capability → worker directory

pub mod cache;
pub mod capability;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkerError;

pub use cache::CapabilityCache;
pub use capability::{normalize, Capability, TypedCapability};

/// Message type stamped on every step dispatch.
pub const WORKFLOW_STEP_MESSAGE: &str = "workflow_step";

/// Status a worker reports when it can take work immediately.
pub const IDLE_STATUS: &str = "idle";

/// Outbound message for a step dispatch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub content: Map<String, Value>,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Builds a `workflow_step` message.
    pub fn workflow_step(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            content,
            message_type: WORKFLOW_STEP_MESSAGE.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A worker's reply to a dispatched message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub content: Map<String, Value>,
}

impl Response {
    pub fn new(content: Map<String, Value>) -> Self {
        Self { content }
    }

    /// A reply carrying `success: true` plus `fields`.
    pub fn success(fields: Map<String, Value>) -> Self {
        let mut content = fields;
        content.insert("success".to_string(), Value::Bool(true));
        Self { content }
    }

    /// A reply carrying `success: false` and an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut content = Map::new();
        content.insert("success".to_string(), Value::Bool(false));
        content.insert("error".to_string(), Value::String(error.into()));
        Self { content }
    }

    /// Reads the success indicator. Anything but `true` is unsuccessful.
    pub fn is_success(&self) -> bool {
        self.content.get("success").and_then(Value::as_bool) == Some(true)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.content.get("error").and_then(Value::as_str)
    }
}

/// A worker that performs step work.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identity string recorded on steps assigned to this worker.
    fn agent_id(&self) -> &str;

    /// Current availability; [`IDLE_STATUS`] is preferred during selection.
    fn status(&self) -> String;

    /// Capabilities this worker advertises.
    async fn get_capabilities(&self) -> Result<Vec<Capability>, WorkerError>;

    /// Handles one dispatched message.
    async fn process_message(&self, message: Message) -> Result<Response, WorkerError>;
}

/// Enumerates the workers available for routing.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn get_all_agents(&self) -> Vec<Arc<dyn Worker>>;
}

/// Registry over a fixed set of workers held by the host.
#[derive(Clone, Default)]
pub struct StaticRegistry {
    workers: Vec<Arc<dyn Worker>>,
}

impl StaticRegistry {
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
        Self { workers }
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[async_trait]
impl CapabilityRegistry for StaticRegistry {
    async fn get_all_agents(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_step_message() {
        let mut content = Map::new();
        content.insert("query".to_string(), json!("rust"));
        let message = Message::workflow_step("engine", "worker-1", content);

        assert_eq!(message.message_type, "workflow_step");
        assert_eq!(message.recipient, "worker-1");
        assert_eq!(message.content["query"], "rust");
    }

    #[test]
    fn test_response_success_indicator() {
        assert!(Response::success(Map::new()).is_success());

        let failed = Response::failure("bad input");
        assert!(!failed.is_success());
        assert_eq!(failed.error_message(), Some("bad input"));

        // Missing or non-boolean indicators are unsuccessful
        assert!(!Response::default().is_success());
        let mut content = Map::new();
        content.insert("success".to_string(), json!("yes"));
        assert!(!Response::new(content).is_success());
    }

    #[tokio::test]
    async fn test_static_registry() {
        use crate::testing::ScriptedWorker;

        let registry = StaticRegistry::default()
            .with_worker(Arc::new(ScriptedWorker::succeeding("w1", &["search"])));
        assert_eq!(registry.len(), 1);

        let agents = registry.get_all_agents().await;
        assert_eq!(agents[0].agent_id(), "w1");
    }
}
