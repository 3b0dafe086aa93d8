//! Dispatches a solved graph through the executor.
//!
//! Two modes share one per-node protocol ([`node`]):
//!
//! - **Level** (default): levels run in ascending order; nodes of a level run
//!   in parallel up to a per-level concurrency, and the next level starts
//!   only once the whole level has finished.
//! - **Pipelined**: a ready queue seeded with the roots; a node is queued as
//!   soon as all of its dependencies completed. Concurrency is bounded by
//!   the operation permits alone.
//!
//! The first failure cancels everything still in flight.

mod level;
pub mod node;
mod pipeline;

use crate::builder::cache::CacheEngine;
use crate::builder::executor::Executor;
use crate::builder::graph::{BuildGraph, NodeStatus};
use crate::config::{DEFAULT_OP_TIMEOUT, DEFAULT_STAGE_TIMEOUT};
use crate::error::KilnError;
use crate::events::EventBus;
use crate::observability::MetricsCollector;
use crate::resources::ResourceManager;
use crate::types::{OperationResult, Platform};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// How ready nodes are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Level,
    Pipelined,
}

/// Scheduler knobs for one per-platform build.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: DispatchMode,
    /// Upper bound for per-level concurrency.
    pub max_concurrent_ops: usize,
    pub op_timeout: Duration,
    /// Deadline for each level in level mode.
    pub stage_timeout: Duration,
    /// Skip cache reads; results are still written.
    pub no_cache: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Level,
            max_concurrent_ops: 4,
            op_timeout: DEFAULT_OP_TIMEOUT,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            no_cache: false,
        }
    }
}

/// Everything a node needs, shared by all tasks of one per-platform build.
pub struct SchedulerContext {
    pub platform: Platform,
    pub cache: CacheEngine,
    pub resources: Arc<ResourceManager>,
    pub executor: Arc<dyn Executor>,
    pub events: EventBus,
    pub collector: Arc<MetricsCollector>,
    pub dockerfile_hash: String,
    pub context_hash: String,
    /// Scratch directory of this per-platform build.
    pub work_dir: PathBuf,
    pub config: SchedulerConfig,
}

/// What a scheduling run did.
#[derive(Debug)]
pub struct ScheduleReport {
    /// Final status per node id.
    pub statuses: Vec<NodeStatus>,
    /// Result per node id, for nodes that completed.
    pub results: Vec<Option<OperationResult>>,
    pub completed: usize,
    pub cache_hits: usize,
    pub duration: Duration,
    /// The first failure, if any.
    pub failure: Option<KilnError>,
}

impl ScheduleReport {
    fn new(len: usize) -> Self {
        Self {
            statuses: vec![NodeStatus::Pending; len],
            results: vec![None; len],
            completed: 0,
            cache_hits: 0,
            duration: Duration::ZERO,
            failure: None,
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.statuses.iter().all(|s| *s == NodeStatus::Completed)
    }

    fn mark_running(&mut self, id: usize) {
        self.statuses[id] = NodeStatus::Running;
    }

    /// Records a node outcome; keeps only the first failure.
    fn record(&mut self, id: usize, outcome: Result<OperationResult, KilnError>) -> bool {
        match outcome {
            Ok(result) => {
                self.statuses[id] = NodeStatus::Completed;
                self.completed += 1;
                if result.cache_hit {
                    self.cache_hits += 1;
                }
                self.results[id] = Some(result);
                true
            }
            Err(err) => {
                self.statuses[id] = NodeStatus::Failed;
                self.fail(err);
                false
            }
        }
    }

    fn fail(&mut self, err: KilnError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

/// Per-level concurrency: `min(max, level_size, max / (level + 1) + 1)`, at least 1.
pub fn level_concurrency(max_ops: usize, level_size: usize, level: usize) -> usize {
    max_ops.min(level_size).min(max_ops / (level + 1) + 1).max(1)
}

pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Runs every node of `graph`, honouring `cancel`.
    #[instrument(skip_all, fields(platform = %self.ctx.platform, nodes = graph.len()))]
    pub async fn run(&self, graph: Arc<BuildGraph>, cancel: &CancellationToken) -> ScheduleReport {
        let started = Instant::now();
        let mut report = ScheduleReport::new(graph.len());

        match self.ctx.config.mode {
            DispatchMode::Level => level::run(&self.ctx, &graph, cancel, &mut report).await,
            DispatchMode::Pipelined => pipeline::run(&self.ctx, &graph, cancel, &mut report).await,
        }

        if report.failure.is_none() && report.completed < graph.len() {
            report.fail(KilnError::cancelled("build cancelled before all operations ran"));
        }
        report.duration = started.elapsed();

        match &report.failure {
            None => info!(
                completed = report.completed,
                cache_hits = report.cache_hits,
                duration_ms = report.duration.as_millis() as u64,
                "Scheduled all operations"
            ),
            Some(err) => warn!(completed = report.completed, error = %err, "Scheduling stopped"),
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Executor doubles shared by the scheduler tests.

    use super::*;
    use crate::config::ResourceLimits;
    use crate::types::{Operation, OperationType};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Sleeps, records start order and peak concurrency; fails on request.
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub delay: Duration,
        pub fail_on: Option<String>,
        pub started: Mutex<Vec<String>>,
        pub finished: Mutex<Vec<String>>,
        pub running: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl RecordingExecutor {
        pub fn with_delay(delay: Duration) -> Self {
            Self { delay, ..Default::default() }
        }

        pub fn calls(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn execute(
            &self,
            operation: &Operation,
            _work_dir: &Path,
            cancel: &CancellationToken,
        ) -> crate::error::Result<OperationResult> {
            let name = operation.outputs.first().cloned().unwrap_or_default();
            self.started.lock().unwrap().push(name.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(KilnError::cancelled("interrupted")),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome?;

            self.finished.lock().unwrap().push(name.clone());
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Ok(OperationResult::failed(operation, "exit status 1"));
            }
            Ok(OperationResult::succeeded(operation, vec![format!("id-{}", name)]))
        }
    }

    pub fn op(name: &str, inputs: &[&str]) -> Operation {
        let mut op = Operation::new(OperationType::Exec, vec!["RUN".into(), name.into()], "linux/amd64".parse().unwrap());
        op.inputs = inputs.iter().map(|s| s.to_string()).collect();
        op.outputs = vec![name.to_string()];
        op
    }

    /// `a -> {b, c, d} -> e`, with `a` reading an external image.
    pub fn diamond() -> Arc<BuildGraph> {
        let ops = vec![
            op("a", &["image://alpine:latest"]),
            op("b", &["a"]),
            op("c", &["a"]),
            op("d", &["a"]),
            op("e", &["b", "c", "d"]),
        ];
        Arc::new(BuildGraph::solve(ops).unwrap())
    }

    pub fn context(
        cache_dir: &Path,
        work_dir: &Path,
        executor: Arc<dyn Executor>,
        max_ops: usize,
        mode: DispatchMode,
    ) -> SchedulerContext {
        let limits = ResourceLimits {
            max_concurrent_builds: 1,
            max_concurrent_ops: max_ops,
            sample_interval: Duration::from_millis(20),
            ..Default::default()
        };
        SchedulerContext {
            platform: "linux/amd64".parse().unwrap(),
            cache: CacheEngine::open(cache_dir).unwrap(),
            resources: Arc::new(ResourceManager::new(limits).unwrap()),
            executor,
            events: EventBus::new(),
            collector: Arc::new(MetricsCollector::new()),
            dockerfile_hash: "df".into(),
            context_hash: "ctx".into(),
            work_dir: work_dir.to_path_buf(),
            config: SchedulerConfig { mode, max_concurrent_ops: max_ops, ..Default::default() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[test]
    fn test_level_concurrency() {
        assert_eq!(level_concurrency(8, 3, 0), 3);
        assert_eq!(level_concurrency(8, 10, 0), 8);
        assert_eq!(level_concurrency(8, 10, 1), 5);
        assert_eq!(level_concurrency(8, 10, 3), 3);
        assert_eq!(level_concurrency(1, 10, 9), 1);
        assert_eq!(level_concurrency(8, 0, 2), 1);
    }

    async fn run(mode: DispatchMode, executor: Arc<RecordingExecutor>, max_ops: usize) -> (ScheduleReport, TempDir) {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(context(&dir.path().join("cache"), dir.path(), executor, max_ops, mode));
        let report = scheduler.run(diamond(), &CancellationToken::new()).await;
        (report, dir)
    }

    #[tokio::test]
    async fn test_dependencies_respected_in_both_modes() {
        for mode in [DispatchMode::Level, DispatchMode::Pipelined] {
            let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(5)));
            let (report, _dir) = run(mode, Arc::clone(&executor), 4).await;
            assert!(report.success(), "{:?}", report.failure);
            assert_eq!(report.completed, 5);

            let started = executor.started.lock().unwrap().clone();
            let finished = executor.finished.lock().unwrap().clone();
            assert_eq!(started.first().map(String::as_str), Some("a"));
            assert_eq!(started.last().map(String::as_str), Some("e"));
            // e starts only after b, c and d finished
            let finished_before_e: Vec<_> = finished.iter().take(4).cloned().collect();
            for dep in ["b", "c", "d"] {
                assert!(finished_before_e.contains(&dep.to_string()));
            }
        }
    }

    #[tokio::test]
    async fn test_permit_bound() {
        let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_millis(20)));
        let (report, _dir) = run(DispatchMode::Pipelined, Arc::clone(&executor), 2).await;
        assert!(report.success());
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let scheduler = Scheduler::new(context(&dir.path().join("cache"), dir.path(), executor.clone(), 4, DispatchMode::Level));
        let cancel = CancellationToken::new();

        let cold = scheduler.run(diamond(), &cancel).await;
        assert_eq!(cold.cache_hits, 0);
        let warm = scheduler.run(diamond(), &cancel).await;
        assert_eq!(warm.cache_hits, 5);
        assert_eq!(executor.calls(), 5);
        assert!(warm.results.iter().all(|r| r.as_ref().is_some_and(|r| r.cache_hit)));
    }

    #[tokio::test]
    async fn test_failure_stops_later_levels() {
        for mode in [DispatchMode::Level, DispatchMode::Pipelined] {
            let executor = Arc::new(RecordingExecutor { fail_on: Some("b".into()), ..Default::default() });
            let (report, _dir) = run(mode, Arc::clone(&executor), 4).await;

            assert!(!report.success());
            assert_eq!(report.failure.as_ref().unwrap().kind(), ErrorKind::Executor);
            assert_eq!(report.statuses[1], NodeStatus::Failed);
            assert_eq!(report.statuses[4], NodeStatus::Pending);
            assert!(!executor.started.lock().unwrap().contains(&"e".to_string()));
        }
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_secs(5)));
        let mut ctx = context(&dir.path().join("cache"), dir.path(), executor, 2, DispatchMode::Level);
        ctx.config.op_timeout = Duration::from_millis(30);

        let report = Scheduler::new(ctx).run(diamond(), &CancellationToken::new()).await;
        assert_eq!(report.failure.unwrap().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_secs(5)));
        let mut ctx = context(&dir.path().join("cache"), dir.path(), executor, 2, DispatchMode::Level);
        ctx.config.stage_timeout = Duration::from_millis(30);

        let report = Scheduler::new(ctx).run(diamond(), &CancellationToken::new()).await;
        assert_eq!(report.failure.unwrap().kind(), ErrorKind::Timeout);
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::with_delay(Duration::from_secs(5)));
        let scheduler = Scheduler::new(context(&dir.path().join("cache"), dir.path(), executor, 2, DispatchMode::Pipelined));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = scheduler.run(diamond(), &cancel).await;
        assert_eq!(report.failure.unwrap().kind(), ErrorKind::Cancelled);
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn test_events_and_profiles() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let scheduler = Scheduler::new(context(&dir.path().join("cache"), dir.path(), executor, 4, DispatchMode::Level));
        let mut events = scheduler.context().events.subscribe(vec!["operation.completed".into()]);

        let report = scheduler.run(diamond(), &CancellationToken::new()).await;
        assert!(report.success());
        assert_eq!(events.drain().len(), 5);

        let profile = scheduler.context().resources.profiler().profile(crate::types::OperationType::Exec).unwrap();
        assert_eq!(profile.count, 5);
        assert_eq!(scheduler.context().collector.snapshot().by_type["exec"].executed, 5);
        assert_eq!(scheduler.context().resources.active_monitors(), 0);
    }
}
