//! Folds build events into per-platform progress.

use crate::events::{Event, EventSubscriber, EventType};
use serde::Serialize;
use std::collections::BTreeMap;

/// Progress of one per-platform build.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformProgress {
    /// Operations in the solved graph; 0 until the platform starts.
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub cached: usize,
    pub failed: usize,
    /// `Some` once the platform build finished.
    pub success: Option<bool>,
}

impl PlatformProgress {
    /// Finished operations (executed, cached or failed).
    pub fn done(&self) -> usize {
        self.completed + self.cached + self.failed
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.success.is_some() { 1.0 } else { 0.0 };
        }
        (self.done() as f64 / self.total as f64).min(1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    platforms: BTreeMap<String, PlatformProgress>,
    finished: Option<bool>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Events without a platform are build-level.
    pub fn apply(&mut self, event: &Event) {
        let Some(kind) = EventType::parse(&event.event_type) else { return };

        match kind {
            EventType::BuildCompleted => self.finished = Some(true),
            EventType::BuildFailed => self.finished = Some(false),
            EventType::PlatformStarted => {
                let total = event.meta("operations").and_then(|n| n.parse().ok()).unwrap_or(0);
                self.platforms.entry(event.resource_id.clone()).or_default().total = total;
            }
            EventType::PlatformCompleted | EventType::PlatformFailed => {
                let progress = self.platforms.entry(event.resource_id.clone()).or_default();
                progress.success = Some(kind == EventType::PlatformCompleted);
                progress.running = 0;
            }
            EventType::OperationStarted
            | EventType::OperationCompleted
            | EventType::OperationCached
            | EventType::OperationFailed => {
                let Some(platform) = event.meta("platform") else { return };
                let progress = self.platforms.entry(platform.to_string()).or_default();
                match kind {
                    EventType::OperationStarted => progress.running += 1,
                    EventType::OperationCompleted => finish(&mut progress.completed, &mut progress.running),
                    EventType::OperationCached => finish(&mut progress.cached, &mut progress.running),
                    _ => finish(&mut progress.failed, &mut progress.running),
                }
            }
            _ => {}
        }
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformProgress> {
        self.platforms.get(name)
    }

    pub fn platforms(&self) -> &BTreeMap<String, PlatformProgress> {
        &self.platforms
    }

    /// Sum of finished operations over the sum of totals, across platforms.
    pub fn overall_fraction(&self) -> f64 {
        let total: usize = self.platforms.values().map(|p| p.total).sum();
        if total == 0 {
            return if self.finished.is_some() { 1.0 } else { 0.0 };
        }
        let done: usize = self.platforms.values().map(|p| p.done().min(p.total)).sum();
        done as f64 / total as f64
    }

    /// `Some(success)` once the build finished.
    pub fn finished(&self) -> Option<bool> {
        self.finished
    }

    /// Consumes events until the build finishes or the bus closes,
    /// calling `on_update` after each event.
    pub async fn follow<F>(mut subscriber: EventSubscriber, mut on_update: F) -> Self
    where
        F: FnMut(&ProgressTracker, &Event),
    {
        let mut tracker = Self::new();
        while let Some(event) = subscriber.recv().await {
            tracker.apply(&event);
            on_update(&tracker, &event);
            if tracker.finished.is_some() {
                break;
            }
        }
        tracker
    }
}

fn finish(counter: &mut usize, running: &mut usize) {
    *counter += 1;
    *running = running.saturating_sub(1);
}
