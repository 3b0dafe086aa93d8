//! In-process aggregation of operation metrics for the build report.

use super::metrics;
use crate::types::OperationType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counters for one operation type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub executed: u64,
    pub cached: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl OperationMetrics {
    pub fn count(&self) -> u64 {
        self.executed + self.cached + self.failed
    }
}

/// Point-in-time copy of everything collected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub by_type: BTreeMap<String, OperationMetrics>,
    pub by_platform: BTreeMap<String, OperationMetrics>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Errors seen, keyed by error kind.
    pub errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Thread-safe collector shared by the scheduler tasks of one build.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsSnapshot>,
}

/// How an operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Executed,
    Cached,
    Failed,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Executed => "executed",
            OperationOutcome::Cached => "cached",
            OperationOutcome::Failed => "failed",
        }
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(
        &self,
        platform: &str,
        op_type: OperationType,
        outcome: OperationOutcome,
        duration: Duration,
    ) {
        metrics::record_operation(op_type.as_str(), outcome.as_str(), duration.as_secs_f64());

        let Ok(mut inner) = self.inner.lock() else { return };
        bump(inner.by_type.entry(op_type.as_str().to_string()).or_default(), outcome, duration);
        bump(inner.by_platform.entry(platform.to_string()).or_default(), outcome, duration);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        metrics::record_cache_lookup(hit);
        if let Ok(mut inner) = self.inner.lock() {
            if hit {
                inner.cache_hits += 1;
            } else {
                inner.cache_misses += 1;
            }
        }
    }

    pub fn record_error(&self, kind: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.errors.entry(kind.to_string()).or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn bump(bucket: &mut OperationMetrics, outcome: OperationOutcome, duration: Duration) {
    match outcome {
        OperationOutcome::Executed => bucket.executed += 1,
        OperationOutcome::Cached => bucket.cached += 1,
        OperationOutcome::Failed => bucket.failed += 1,
    }
    bucket.total_duration += duration;
    bucket.max_duration = bucket.max_duration.max(duration);
}
