//! Capability Directory Cache
//!
//! Maps canonical capability keys to the workers advertising them. The map
//! is rebuilt from the registry when it is empty or older than the TTL.
//! Rebuilds are serialized; a worker whose capability query fails is
//! skipped and the rebuild continues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::capability::normalize;
use super::{CapabilityRegistry, Worker, IDLE_STATUS};

/// Default time a directory snapshot stays fresh.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Directory {
    by_capability: HashMap<String, Vec<Arc<dyn Worker>>>,
    refreshed_at: Option<Instant>,
}

impl Directory {
    fn is_stale(&self, ttl: Duration) -> bool {
        match self.refreshed_at {
            None => true,
            Some(at) => self.by_capability.is_empty() || at.elapsed() > ttl,
        }
    }
}

/// Time-bounded capability → worker directory.
pub struct CapabilityCache {
    registry: Arc<dyn CapabilityRegistry>,
    ttl: Duration,
    directory: Mutex<Directory>,
}

impl CapabilityCache {
    pub fn new(registry: Arc<dyn CapabilityRegistry>) -> Self {
        Self::with_ttl(registry, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(registry: Arc<dyn CapabilityRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            directory: Mutex::new(Directory::default()),
        }
    }

    /// Finds a worker for `capability`.
    ///
    /// Prefers a worker reporting `idle`, then the first known worker.
    pub async fn resolve(&self, capability: &str) -> Option<Arc<dyn Worker>> {
        let key = normalize(capability);
        let mut directory = self.directory.lock().await;

        if directory.is_stale(self.ttl) {
            self.rebuild(&mut directory).await;
        }

        let workers = directory.by_capability.get(&key)?;
        let selected = workers
            .iter()
            .find(|w| w.status() == IDLE_STATUS)
            .or_else(|| workers.first())
            .cloned();

        if let Some(worker) = &selected {
            debug!("Resolved capability '{}' to worker '{}'", key, worker.agent_id());
        }
        selected
    }

    /// Forces the next resolve to rebuild from the registry.
    pub async fn invalidate(&self) {
        let mut directory = self.directory.lock().await;
        directory.refreshed_at = None;
    }

    /// Rebuilds now, regardless of freshness.
    pub async fn refresh(&self) {
        let mut directory = self.directory.lock().await;
        self.rebuild(&mut directory).await;
    }

    /// Known capability keys, sorted.
    pub async fn capabilities(&self) -> Vec<String> {
        let directory = self.directory.lock().await;
        let mut keys: Vec<String> = directory.by_capability.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn rebuild(&self, directory: &mut Directory) {
        let agents = self.registry.get_all_agents().await;
        let mut by_capability: HashMap<String, Vec<Arc<dyn Worker>>> = HashMap::new();

        for agent in agents {
            let capabilities = match agent.get_capabilities().await {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    warn!(
                        "Skipping worker '{}': capability query failed: {}",
                        agent.agent_id(),
                        e
                    );
                    continue;
                }
            };

            for capability in capabilities {
                let workers = by_capability.entry(capability.key()).or_default();
                if !workers.iter().any(|w| w.agent_id() == agent.agent_id()) {
                    workers.push(Arc::clone(&agent));
                }
            }
        }

        info!(
            "Capability directory rebuilt: {} capabilities",
            by_capability.len()
        );
        directory.by_capability = by_capability;
        directory.refreshed_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{StaticRegistry, TypedCapability};
    use crate::testing::{CountingRegistry, ScriptedWorker};

    fn registry(workers: Vec<ScriptedWorker>) -> Arc<dyn CapabilityRegistry> {
        Arc::new(StaticRegistry::new(
            workers
                .into_iter()
                .map(|w| Arc::new(w) as Arc<dyn Worker>)
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_resolve_prefers_idle_worker() {
        let cache = CapabilityCache::new(registry(vec![
            ScriptedWorker::succeeding("busy", &["search"]).with_status("busy"),
            ScriptedWorker::succeeding("idle", &["search"]),
        ]));

        let worker = cache.resolve("search").await.unwrap();
        assert_eq!(worker.agent_id(), "idle");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_first() {
        let cache = CapabilityCache::new(registry(vec![
            ScriptedWorker::succeeding("first", &["search"]).with_status("busy"),
            ScriptedWorker::succeeding("second", &["search"]).with_status("busy"),
        ]));

        let worker = cache.resolve("search").await.unwrap();
        assert_eq!(worker.agent_id(), "first");
    }

    #[tokio::test]
    async fn test_resolve_unknown_capability() {
        let cache = CapabilityCache::new(registry(vec![ScriptedWorker::succeeding(
            "w",
            &["search"],
        )]));
        assert!(cache.resolve("translate").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_normalizes_keys() {
        let worker = ScriptedWorker::succeeding("typed", &[])
            .with_capability(TypedCapability::member("Web_Search").into());
        let cache = CapabilityCache::new(registry(vec![worker]));

        assert!(cache.resolve(" web_search ").await.is_some());
        assert!(cache.resolve("WEB_SEARCH").await.is_some());
    }

    #[tokio::test]
    async fn test_failing_worker_is_skipped() {
        let cache = CapabilityCache::new(registry(vec![
            ScriptedWorker::succeeding("broken", &["search"]).with_broken_capabilities(),
            ScriptedWorker::succeeding("healthy", &["search", "write"]),
        ]));

        let worker = cache.resolve("search").await.unwrap();
        assert_eq!(worker.agent_id(), "healthy");
        assert_eq!(cache.capabilities().await, vec!["search", "write"]);
    }

    #[tokio::test]
    async fn test_rebuild_only_when_stale() {
        let counting = Arc::new(CountingRegistry::new(vec![Arc::new(
            ScriptedWorker::succeeding("w", &["search"]),
        )]));
        let cache = CapabilityCache::with_ttl(counting.clone(), Duration::from_secs(60));

        cache.resolve("search").await;
        cache.resolve("search").await;
        assert_eq!(counting.calls(), 1);

        cache.invalidate().await;
        cache.resolve("search").await;
        assert_eq!(counting.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_rebuilds_every_time() {
        let counting = Arc::new(CountingRegistry::new(vec![Arc::new(
            ScriptedWorker::succeeding("w", &["search"]),
        )]));
        let cache = CapabilityCache::with_ttl(counting.clone(), Duration::ZERO);

        cache.resolve("search").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.resolve("search").await;
        assert_eq!(counting.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_directory_rebuilds() {
        let counting = Arc::new(CountingRegistry::new(Vec::new()));
        let cache = CapabilityCache::with_ttl(counting.clone(), Duration::from_secs(60));

        assert!(cache.resolve("search").await.is_none());
        assert!(cache.resolve("search").await.is_none());
        assert_eq!(counting.calls(), 2);
    }
}
