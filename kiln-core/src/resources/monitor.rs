//! Per-operation resource monitors.
//!
//! A monitor samples the builder process on an interval and folds the samples
//! into a [`MonitorSummary`] when stopped. Rust has no garbage collector, so
//! the samples carry memory, CPU and live task counts only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Samples kept per monitor before older ones are thinned out.
const MAX_SAMPLES: usize = 720;

/// One observation of the builder process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    /// Operations executing when the sample was taken
    pub active_tasks: usize,
}

/// Peak and average usage over a monitor's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub samples: usize,
    pub duration: Duration,
    pub peak_memory_bytes: u64,
    pub avg_memory_bytes: u64,
    pub peak_cpu_percent: f32,
    pub avg_cpu_percent: f32,
    pub peak_tasks: usize,
    pub avg_tasks: f64,
}

impl MonitorSummary {
    pub fn from_samples(samples: &[ResourceSample], duration: Duration) -> Self {
        if samples.is_empty() {
            return Self { duration, ..Default::default() };
        }
        let n = samples.len();
        Self {
            samples: n,
            duration,
            peak_memory_bytes: samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0),
            avg_memory_bytes: samples.iter().map(|s| s.memory_bytes).sum::<u64>() / n as u64,
            peak_cpu_percent: samples.iter().map(|s| s.cpu_percent).fold(0.0, f32::max),
            avg_cpu_percent: samples.iter().map(|s| s.cpu_percent).sum::<f32>() / n as f32,
            peak_tasks: samples.iter().map(|s| s.active_tasks).max().unwrap_or(0),
            avg_tasks: samples.iter().map(|s| s.active_tasks).sum::<usize>() as f64 / n as f64,
        }
    }
}

/// Reads process usage through one shared `sysinfo::System`.
///
/// CPU usage is a delta between refreshes, so the same `System` is reused.
#[derive(Debug)]
pub struct Sampler {
    system: Mutex<System>,
    pid: Option<Pid>,
    active_tasks: Arc<AtomicUsize>,
}

impl Sampler {
    pub fn new(active_tasks: Arc<AtomicUsize>) -> Self {
        let pid = sysinfo::get_current_pid().ok();
        Self { system: Mutex::new(System::new()), pid, active_tasks }
    }

    pub fn sample(&self) -> ResourceSample {
        let active_tasks = self.active_tasks.load(Ordering::Relaxed);
        let Some(pid) = self.pid else {
            return ResourceSample { active_tasks, ..Default::default() };
        };

        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "sampler lock poisoned");
                return ResourceSample { active_tasks, ..Default::default() };
            }
        };

        sys.refresh_process(pid);
        match sys.process(pid) {
            Some(process) => ResourceSample {
                memory_bytes: process.memory(),
                cpu_percent: process.cpu_usage(),
                active_tasks,
            },
            None => ResourceSample { active_tasks, ..Default::default() },
        }
    }

    /// Drops sysinfo's cached process table.
    pub fn release_caches(&self) {
        if let Ok(mut sys) = self.system.lock() {
            *sys = System::new();
        }
    }
}

/// A running sampler task for one key.
#[derive(Debug)]
pub struct ResourceMonitor {
    key: String,
    started: Instant,
    samples: Arc<Mutex<Vec<ResourceSample>>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    /// Takes a first sample immediately, then one per `interval`.
    ///
    /// Outside a tokio runtime only the first sample is taken.
    pub fn start(key: impl Into<String>, sampler: Arc<Sampler>, interval: Duration) -> Self {
        let samples = Arc::new(Mutex::new(vec![sampler.sample()]));
        let stop = CancellationToken::new();

        let handle = tokio::runtime::Handle::try_current().ok().map(|rt| {
            let samples = Arc::clone(&samples);
            let stop = stop.clone();
            rt.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick completes immediately
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let sample = sampler.sample();
                            if let Ok(mut samples) = samples.lock() {
                                samples.push(sample);
                                if samples.len() > MAX_SAMPLES {
                                    thin(&mut samples);
                                }
                            }
                        }
                    }
                }
            })
        });

        Self { key: key.into(), started: Instant::now(), samples, stop, handle }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Halves the retained history.
    pub fn compact(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            thin(&mut samples);
        }
    }

    /// Stops sampling and summarizes what was recorded.
    pub fn stop(mut self) -> MonitorSummary {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let samples = self.samples.lock().map(|s| s.clone()).unwrap_or_default();
        MonitorSummary::from_samples(&samples, self.started.elapsed())
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Keeps every other sample, always retaining the peak-memory one.
fn thin(samples: &mut Vec<ResourceSample>) {
    if samples.len() < 2 {
        return;
    }
    let peak = samples.iter().copied().max_by_key(|s| s.memory_bytes);
    let mut kept: Vec<ResourceSample> = samples.iter().copied().step_by(2).collect();
    if let Some(peak) = peak {
        if !kept.contains(&peak) {
            kept.push(peak);
        }
    }
    *samples = kept;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(memory: u64, cpu: f32, tasks: usize) -> ResourceSample {
        ResourceSample { memory_bytes: memory, cpu_percent: cpu, active_tasks: tasks }
    }

    #[test]
    fn test_summary_peak_and_average() {
        let summary = MonitorSummary::from_samples(
            &[sample(100, 10.0, 1), sample(300, 30.0, 3), sample(200, 20.0, 2)],
            Duration::from_secs(1),
        );
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.peak_memory_bytes, 300);
        assert_eq!(summary.avg_memory_bytes, 200);
        assert_eq!(summary.peak_cpu_percent, 30.0);
        assert!((summary.avg_cpu_percent - 20.0).abs() < 0.001);
        assert_eq!(summary.peak_tasks, 3);
        assert!((summary.avg_tasks - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_summary() {
        let summary = MonitorSummary::from_samples(&[], Duration::from_millis(5));
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.duration, Duration::from_millis(5));
    }

    #[test]
    fn test_thin_keeps_peak() {
        let mut samples = vec![sample(1, 0.0, 0), sample(9, 0.0, 0), sample(2, 0.0, 0), sample(3, 0.0, 0)];
        thin(&mut samples);
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().any(|s| s.memory_bytes == 9));
    }

    #[test]
    fn test_sampler_reports_active_tasks() {
        let active = Arc::new(AtomicUsize::new(3));
        let sampler = Sampler::new(active);
        assert_eq!(sampler.sample().active_tasks, 3);
    }

    #[tokio::test]
    async fn test_monitor_samples_on_interval() {
        let sampler = Arc::new(Sampler::new(Arc::new(AtomicUsize::new(0))));
        let monitor = ResourceMonitor::start("node-1", sampler, Duration::from_millis(10));
        assert_eq!(monitor.key(), "node-1");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let summary = monitor.stop();
        assert!(summary.samples >= 2, "only {} samples", summary.samples);
        assert!(summary.duration >= Duration::from_millis(60));
    }
}
