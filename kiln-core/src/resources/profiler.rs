//! Running per-operation-type usage averages.

use super::monitor::MonitorSummary;
use crate::types::OperationType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Averages for one operation type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationProfile {
    pub count: u64,
    pub avg_duration: Duration,
    pub max_duration: Duration,
    pub avg_memory_bytes: f64,
    pub avg_cpu_percent: f64,
}

impl OperationProfile {
    fn record(&mut self, duration: Duration, summary: &MonitorSummary) {
        self.count += 1;
        let n = self.count as f64;

        let avg_secs = self.avg_duration.as_secs_f64();
        self.avg_duration = Duration::from_secs_f64(avg_secs + (duration.as_secs_f64() - avg_secs) / n);
        self.max_duration = self.max_duration.max(duration);
        self.avg_memory_bytes += (summary.avg_memory_bytes as f64 - self.avg_memory_bytes) / n;
        self.avg_cpu_percent += (summary.avg_cpu_percent as f64 - self.avg_cpu_percent) / n;
    }
}

#[derive(Debug, Default)]
pub struct Profiler {
    profiles: Mutex<BTreeMap<OperationType, OperationProfile>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op_type: OperationType, duration: Duration, summary: &MonitorSummary) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.entry(op_type).or_default().record(duration, summary);
        }
    }

    pub fn profile(&self, op_type: OperationType) -> Option<OperationProfile> {
        self.profiles.lock().ok().and_then(|p| p.get(&op_type).cloned())
    }

    pub fn snapshot(&self) -> BTreeMap<OperationType, OperationProfile> {
        self.profiles.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(memory: u64, cpu: f32) -> MonitorSummary {
        MonitorSummary { samples: 1, avg_memory_bytes: memory, avg_cpu_percent: cpu, ..Default::default() }
    }

    #[test]
    fn test_running_averages() {
        let profiler = Profiler::new();
        profiler.record(OperationType::Exec, Duration::from_millis(100), &summary(100, 10.0));
        profiler.record(OperationType::Exec, Duration::from_millis(300), &summary(300, 30.0));
        profiler.record(OperationType::Meta, Duration::from_millis(1), &summary(1, 0.0));

        let exec = profiler.profile(OperationType::Exec).unwrap();
        assert_eq!(exec.count, 2);
        assert_eq!(exec.avg_duration, Duration::from_millis(200));
        assert_eq!(exec.max_duration, Duration::from_millis(300));
        assert!((exec.avg_memory_bytes - 200.0).abs() < 1e-9);
        assert!((exec.avg_cpu_percent - 20.0).abs() < 1e-6);

        assert_eq!(profiler.snapshot().len(), 2);
        assert!(profiler.profile(OperationType::Pull).is_none());
    }
}
