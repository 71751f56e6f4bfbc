//! Test doubles for worker and registry collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::WorkerError;
use crate::registry::{Capability, CapabilityRegistry, Message, Response, Worker, IDLE_STATUS};

/// One scripted reaction to a dispatched message.
#[derive(Debug, Clone)]
pub enum Reply {
    Success,
    Failure(String),
    Error(String),
    Panic,
}

/// Worker whose replies follow a script, then a default.
pub struct ScriptedWorker {
    id: String,
    status: String,
    capabilities: Vec<Capability>,
    broken_capabilities: bool,
    script: Mutex<VecDeque<Reply>>,
    default_reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
    received: Mutex<Vec<Message>>,
}

impl ScriptedWorker {
    fn new(id: &str, capabilities: &[&str], default_reply: Reply) -> Self {
        Self {
            id: id.to_string(),
            status: IDLE_STATUS.to_string(),
            capabilities: capabilities.iter().map(|c| Capability::from(*c)).collect(),
            broken_capabilities: false,
            script: Mutex::new(VecDeque::new()),
            default_reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(id: &str, capabilities: &[&str]) -> Self {
        Self::new(id, capabilities, Reply::Success)
    }

    pub fn failing(id: &str, capabilities: &[&str]) -> Self {
        Self::new(id, capabilities, Reply::Failure("worker refused".to_string()))
    }

    pub fn erroring(id: &str, capabilities: &[&str]) -> Self {
        Self::new(id, capabilities, Reply::Error("connection reset".to_string()))
    }

    pub fn panicking(id: &str, capabilities: &[&str]) -> Self {
        Self::new(id, capabilities, Reply::Panic)
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_broken_capabilities(mut self) -> Self {
        self.broken_capabilities = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replies consumed in order before falling back to the default.
    pub fn with_script(self, replies: Vec<Reply>) -> Self {
        *self.script.lock().unwrap() = replies.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn agent_id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> String {
        self.status.clone()
    }

    async fn get_capabilities(&self) -> Result<Vec<Capability>, WorkerError> {
        if self.broken_capabilities {
            return Err(WorkerError::new("capability endpoint unavailable"));
        }
        Ok(self.capabilities.clone())
    }

    async fn process_message(&self, message: Message) -> Result<Response, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(message.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        match reply {
            Reply::Success => {
                let mut fields = Map::new();
                fields.insert("agent".to_string(), Value::String(self.id.clone()));
                fields.insert("echo".to_string(), Value::Object(message.content));
                Ok(Response::success(fields))
            }
            Reply::Failure(error) => Ok(Response::failure(error)),
            Reply::Error(error) => Err(WorkerError::new(error)),
            Reply::Panic => panic!("worker '{}' crashed", self.id),
        }
    }
}

/// Registry that counts how often it is enumerated.
pub struct CountingRegistry {
    workers: Vec<Arc<dyn Worker>>,
    calls: AtomicUsize,
}

impl CountingRegistry {
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
        Self {
            workers,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityRegistry for CountingRegistry {
    async fn get_all_agents(&self) -> Vec<Arc<dyn Worker>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.workers.clone()
    }
}
