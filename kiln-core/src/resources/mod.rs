//! Resource manager: permits, monitors, profiling and optimization.
//!
//! Two counting semaphores bound concurrency: build permits (per-platform
//! builds) and operation permits (operation executions). Monitors sample the
//! builder process per running operation; their summaries feed the profiler,
//! and the optimizer periodically adjusts capacity from observed usage.

pub mod monitor;
pub mod optimizer;
pub mod profiler;

pub use monitor::{MonitorSummary, ResourceMonitor, ResourceSample, Sampler};
pub use optimizer::{OptimizationRule, Optimizer, OptimizerAction, UsageSnapshot};
pub use profiler::{OperationProfile, Profiler};

use crate::config::ResourceLimits;
use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An operation permit. Releases its slot and the active-op count on drop.
#[derive(Debug)]
pub struct OpPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for OpPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide resource state for one builder instance.
#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    build_permits: Arc<Semaphore>,
    op_permits: Arc<Semaphore>,
    op_capacity: AtomicUsize,
    active_ops: Arc<AtomicUsize>,
    peak_active_ops: AtomicUsize,
    sampler: Arc<Sampler>,
    monitors: Mutex<HashMap<String, ResourceMonitor>>,
    profiler: Profiler,
    optimizer: Mutex<Optimizer>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Result<Self> {
        limits.validate()?;
        let active_ops = Arc::new(AtomicUsize::new(0));
        let optimizer = Optimizer::from_limits(limits.memory_pressure_bytes, limits.memory_limit_bytes);

        info!(
            builds = limits.max_concurrent_builds,
            ops = limits.max_concurrent_ops,
            "Initialized resource manager"
        );

        Ok(Self {
            build_permits: Arc::new(Semaphore::new(limits.max_concurrent_builds)),
            op_permits: Arc::new(Semaphore::new(limits.max_concurrent_ops)),
            op_capacity: AtomicUsize::new(limits.max_concurrent_ops),
            sampler: Arc::new(Sampler::new(Arc::clone(&active_ops))),
            active_ops,
            peak_active_ops: AtomicUsize::new(0),
            monitors: Mutex::new(HashMap::new()),
            profiler: Profiler::new(),
            optimizer: Mutex::new(optimizer),
            limits,
        })
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Current operation-permit capacity.
    pub fn op_capacity(&self) -> usize {
        self.op_capacity.load(Ordering::Acquire)
    }

    /// Operations holding a permit right now.
    pub fn active_ops(&self) -> usize {
        self.active_ops.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held operation permits.
    pub fn peak_active_ops(&self) -> usize {
        self.peak_active_ops.load(Ordering::Acquire)
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Waits for a build permit until `deadline` or cancellation.
    pub async fn acquire_build(
        &self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        self.check_hard_limit()?;
        acquire(Arc::clone(&self.build_permits), deadline, cancel, "build").await
    }

    /// Waits for an operation permit until `deadline` or cancellation.
    pub async fn acquire_op(&self, deadline: Option<Instant>, cancel: &CancellationToken) -> Result<OpPermit> {
        self.check_hard_limit()?;
        let permit = acquire(Arc::clone(&self.op_permits), deadline, cancel, "operation").await?;
        let active = self.active_ops.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active_ops.fetch_max(active, Ordering::AcqRel);
        Ok(OpPermit { _permit: permit, active: Arc::clone(&self.active_ops) })
    }

    /// Under a hard limit, refuses new permits while over the memory ceiling.
    fn check_hard_limit(&self) -> Result<()> {
        let (true, Some(limit)) = (self.limits.hard_limit, self.limits.memory_limit_bytes) else {
            return Ok(());
        };
        let sample = self.sampler.sample();
        if sample.memory_bytes > limit {
            return Err(KilnError::ResourceExhausted {
                reason: format!("memory usage {} bytes exceeds hard limit {} bytes", sample.memory_bytes, limit),
            });
        }
        Ok(())
    }

    /// Starts a monitor for `key`, replacing any previous one.
    pub fn start_monitor(&self, key: &str) {
        let monitor = ResourceMonitor::start(key, Arc::clone(&self.sampler), self.limits.sample_interval);
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.insert(key.to_string(), monitor);
        }
    }

    /// Stops the monitor for `key` and returns its summary.
    pub fn stop_monitor(&self, key: &str) -> Option<MonitorSummary> {
        let monitor = self.monitors.lock().ok()?.remove(key)?;
        Some(monitor.stop())
    }

    pub fn active_monitors(&self) -> usize {
        self.monitors.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Current usage as seen by the optimizer.
    pub fn usage(&self) -> UsageSnapshot {
        let sample = self.sampler.sample();
        UsageSnapshot {
            memory_bytes: sample.memory_bytes,
            active_ops: self.active_ops(),
            op_capacity: self.op_capacity(),
        }
    }

    /// Evaluates the optimizer rules once and applies their actions.
    pub fn optimize_once(&self) -> Vec<OptimizerAction> {
        let usage = self.usage();
        crate::observability::metrics::set_resource_usage(usage.op_capacity, usage.active_ops);
        let actions = match self.optimizer.lock() {
            Ok(mut optimizer) => optimizer.evaluate(&usage),
            Err(_) => Vec::new(),
        };
        for action in &actions {
            self.apply(*action);
        }
        actions
    }

    fn apply(&self, action: OptimizerAction) {
        match action {
            OptimizerAction::ReleaseMemory => {
                if let Ok(monitors) = self.monitors.lock() {
                    monitors.values().for_each(ResourceMonitor::compact);
                }
                self.sampler.release_caches();
                debug!("Released retained sampling memory");
            }
            OptimizerAction::HalveOpCapacity => {
                self.reduce_op_capacity();
            }
        }
    }

    /// Halves the operation-permit capacity, never below 1.
    ///
    /// Permits in use are withdrawn as they are released.
    pub fn reduce_op_capacity(&self) -> usize {
        let current = self.op_capacity();
        let target = optimizer::halved(current);
        let remove = current - target;
        if remove == 0 {
            return current;
        }
        self.op_capacity.store(target, Ordering::Release);
        warn!(from = current, to = target, "Reducing operation concurrency");

        let available = self.op_permits.available_permits().min(remove);
        if available > 0 {
            if let Ok(permits) = self.op_permits.try_acquire_many(available as u32) {
                permits.forget();
            }
        }
        let pending = remove - available;
        if pending > 0 {
            let semaphore = Arc::clone(&self.op_permits);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(pending as u32).await {
                        permits.forget();
                    }
                });
            }
        }
        target
    }

    /// Runs the optimizer every sample interval until `cancel` fires.
    pub fn spawn_optimizer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.limits.sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let actions = manager.optimize_once();
                        if !actions.is_empty() {
                            debug!(?actions, "Applied optimizer actions");
                        }
                    }
                }
            }
        })
    }
}

async fn acquire(
    semaphore: Arc<Semaphore>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    what: &str,
) -> Result<OwnedSemaphorePermit> {
    let wait = async {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, semaphore.acquire_owned())
                .await
                .map_err(|_| KilnError::cancelled(format!("deadline passed waiting for {} permit", what)))?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| KilnError::Internal(format!("{} permit semaphore closed", what)))
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KilnError::cancelled(format!("cancelled waiting for {} permit", what))),
        permit = wait => permit,
    }
}

/// Deadline `after` from now, as accepted by the acquire functions.
pub fn deadline_after(after: Duration) -> Instant {
    Instant::now() + after
}
