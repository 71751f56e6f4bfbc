//! Execution Timeline
//!
//! Records when each step of a run started and finished, for duration
//! reports and the parallel efficiency of a group of steps.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventType {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct TimelineEvent {
    step_id: String,
    event_type: EventType,
    timestamp: Instant,
}

/// Event log of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records a finished step from instants captured by its task.
    pub fn record_span(&mut self, step_id: &str, started: Instant, finished: Instant, success: bool) {
        self.push(step_id.to_string(), EventType::Started, started);
        let end = if success {
            EventType::Completed
        } else {
            EventType::Failed
        };
        self.push(step_id.to_string(), end, finished.max(started));
    }

    fn push(&mut self, step_id: String, event_type: EventType, timestamp: Instant) {
        self.events.push(TimelineEvent {
            step_id,
            event_type,
            timestamp,
        });
    }

    /// Start and end instant of every step with both events recorded.
    fn spans(&self) -> HashMap<String, (Instant, Instant)> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut spans = HashMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.as_str(), event.timestamp);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(event.step_id.as_str()) {
                        spans.insert(event.step_id.clone(), (*start, event.timestamp));
                    }
                }
            }
        }

        spans
    }

    /// Busy time of `step_ids` over `members * wall time`, clamped to [0, 1].
    ///
    /// Wall time runs from the earliest member start to the latest member
    /// end. Returns `None` when no member finished or no time elapsed.
    pub fn efficiency(&self, step_ids: &[&str]) -> Option<f64> {
        let spans = self.spans();
        let members: Vec<(Instant, Instant)> = step_ids
            .iter()
            .filter_map(|id| spans.get(*id).copied())
            .collect();

        let first = members.iter().map(|(start, _)| *start).min()?;
        let last = members.iter().map(|(_, end)| *end).max()?;
        let wall = last.saturating_duration_since(first).as_secs_f64();
        if wall <= 0.0 {
            return None;
        }

        let busy: f64 = members
            .iter()
            .map(|(start, end)| end.saturating_duration_since(*start).as_secs_f64())
            .sum();

        Some((busy / (wall * members.len() as f64)).clamp(0.0, 1.0))
    }

    /// One line per finished step, ordered by start, offsets in milliseconds.
    pub fn report(&self) -> String {
        let mut spans: Vec<(String, (Instant, Instant))> = self.spans().into_iter().collect();
        spans.sort_by_key(|(_, (start, _))| *start);

        let mut output = String::new();
        for (step_id, (start, end)) in spans {
            output.push_str(&format!(
                "{:<16} +{:>6} ms  {:>6} ms\n",
                step_id,
                start.saturating_duration_since(self.start_time).as_millis(),
                end.saturating_duration_since(start).as_millis()
            ));
        }
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}
