//! Resource Usage Sampling
//!
//! Samples CPU and memory usage of the current process and feeds them to
//! the monitor as percentages, where they are checked against the cpu and
//! memory thresholds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};
use tokio::task::JoinHandle;

use super::metrics::{MetricsUpdate, Monitor};

/// Resource name for CPU samples.
pub const RESOURCE_CPU: &str = "cpu";

/// Resource name for memory samples.
pub const RESOURCE_MEMORY: &str = "memory";

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// Share of total CPU capacity, 0-100
    pub cpu_percent: f64,
    /// Share of physical memory, 0-100
    pub memory_percent: f64,
    pub memory_mb: u64,
}

impl ResourceSample {
    pub fn to_update(&self) -> MetricsUpdate {
        MetricsUpdate::default()
            .with_resource(RESOURCE_CPU, self.cpu_percent)
            .with_resource(RESOURCE_MEMORY, self.memory_percent)
    }
}

/// Samples resource usage of the current process.
pub struct ResourceSampler {
    system: System,
    process_id: Pid,
    cpu_count: usize,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceSampler {
    /// Creates a sampler, or `None` if the process id cannot be read.
    pub fn new() -> Option<Self> {
        let process_id = match get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Resource sampling unavailable: {}", e);
                return None;
            }
        };

        Some(Self {
            system: System::new(),
            process_id,
            cpu_count: num_cpus::get().max(1),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        })
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample.
    ///
    /// The first call only primes CPU accounting and returns `None`, as do
    /// calls within `min_interval` of the previous sample.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.system.refresh_memory();
            self.warmup_done = true;
            self.last_sample = Some(now);
            return None;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.system.refresh_memory();
        self.last_sample = Some(now);

        let process = self.system.process(self.process_id)?;
        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            process.memory() as f64 / total_memory as f64 * 100.0
        };

        Some(ResourceSample {
            timestamp: now,
            cpu_percent: f64::from(process.cpu_usage()) / self.cpu_count as f64,
            memory_percent,
            memory_mb: process.memory() / (1024 * 1024),
        })
    }
}

/// Samples every `interval` into `monitor` under `workflow_id` until the
/// returned task is aborted.
pub fn spawn_sampler(
    monitor: Arc<Monitor>,
    workflow_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(sampler) = ResourceSampler::new() else {
            return;
        };
        let mut sampler = sampler.with_min_interval(interval / 2);
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            if let Some(sample) = sampler.sample() {
                debug!(
                    "Resources for '{}': cpu {:.1}%, memory {:.1}% ({} MB)",
                    workflow_id, sample.cpu_percent, sample.memory_percent, sample.memory_mb
                );
                monitor.track(&workflow_id, sample.to_update()).await;
            }
        }
    })
}
