//! Build orchestration.
//!
//! [`Builder`] drives one `build()` from a Dockerfile to an exported
//! artifact:
//!
//! 1. Prepare a scratch work directory and open the cache.
//! 2. Hash the Dockerfile and the build context (respecting ignore patterns).
//! 3. Lower the Dockerfile into operations and solve one graph per platform.
//! 4. Run the per-platform builds (concurrently by default).
//! 5. Export if every platform succeeded.
//! 6. Compose the [`BuildResult`] and the [`BuildReport`].
//!
//! Preparation failures abort immediately. Execution failures are captured
//! per platform; export failures downgrade overall success.

use crate::builder::cache::hash::{compute_context_hash, sha256_hex, IgnorePatterns};
use crate::builder::cache::{default_rules, CacheEngine, PruneStrategy};
use crate::builder::executor::{create_executor, Executor};
use crate::builder::exporter::{Exporter, OciLayoutExporter};
use crate::builder::frontend;
use crate::builder::graph::BuildGraph;
use crate::config::{BuildConfig, ExecutorKind, ResourceLimits, Settings};
use crate::error::{ErrorKind, KilnError, Result};
use crate::events::{Event, EventBus, EventType};
use crate::observability::{metrics, BuildReport, MetricsCollector};
use crate::paths;
use crate::resources::ResourceManager;
use crate::scheduler::{DispatchMode, Scheduler, SchedulerConfig, SchedulerContext};
use crate::types::{BuildResult, Platform, PlatformResult};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Builder-wide settings, shared by every build it runs.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub cache_dir: PathBuf,
    pub work_root: PathBuf,
    /// Where artifacts go when a build names no output path.
    pub output_dir: PathBuf,
    pub limits: ResourceLimits,
    pub executor: ExecutorKind,
    pub prune_strategy: PruneStrategy,
    pub op_timeout: Duration,
    pub stage_timeout: Duration,
}

impl BuilderOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = PruneStrategy::default();
        Self {
            cache_dir: settings.cache_dir.clone(),
            work_root: settings.work_root.clone(),
            output_dir: paths::output_dir(),
            limits: settings.resources.clone(),
            executor: settings.executor,
            prune_strategy: PruneStrategy {
                max_size: settings.cache_max_size_bytes,
                max_age: settings.cache_max_age_secs.map(Duration::from_secs),
                max_files: settings.cache_max_files,
                platform_quota: settings.cache_platform_quota_bytes,
                ..defaults
            },
            op_timeout: settings.op_timeout(),
            stage_timeout: settings.stage_timeout(),
        }
    }
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A finished build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub result: BuildResult,
    pub report: BuildReport,
    /// Path of the exported artifact, if export ran and succeeded.
    pub artifact: Option<PathBuf>,
}

/// Facts computed before any operation runs.
struct Prepared {
    work_dir: TempDir,
    cache: CacheEngine,
    dockerfile_hash: String,
    context_hash: String,
    graphs: Vec<(Platform, Arc<BuildGraph>)>,
}

/// The build orchestrator.
pub struct Builder {
    options: BuilderOptions,
    resources: Arc<ResourceManager>,
    executor: Option<Arc<dyn Executor>>,
    exporter: Arc<dyn Exporter>,
    events: EventBus,
    caches: Mutex<HashMap<PathBuf, CacheEngine>>,
    optimizer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Builder {
    pub fn new(options: BuilderOptions) -> Result<Self> {
        let resources = Arc::new(ResourceManager::new(options.limits.clone())?);
        Ok(Self {
            options,
            resources,
            executor: None,
            exporter: Arc::new(OciLayoutExporter::new()),
            events: EventBus::new(),
            caches: Mutex::new(HashMap::new()),
            optimizer: Mutex::new(None),
        })
    }

    /// Uses `executor` for every build instead of the configured kind.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// The cache engine for `dir`, opened once per builder.
    pub fn cache(&self, dir: &Path) -> Result<CacheEngine> {
        let mut caches = self.caches.lock().map_err(|_| KilnError::Internal("cache registry poisoned".into()))?;
        if let Some(cache) = caches.get(dir) {
            return Ok(cache.clone());
        }
        let cache = CacheEngine::with_config(dir, default_rules(), self.options.prune_strategy.clone())?;
        caches.insert(dir.to_path_buf(), cache.clone());
        Ok(cache)
    }

    /// Stops the optimizer and waits for background cache maintenance.
    pub async fn shutdown(&self) {
        let optimizer = self.optimizer.lock().ok().and_then(|mut o| o.take());
        if let Some((token, handle)) = optimizer {
            token.cancel();
            let _ = handle.await;
        }

        let caches: Vec<CacheEngine> =
            self.caches.lock().map(|c| c.values().cloned().collect()).unwrap_or_default();
        for cache in caches {
            cache.join_background().await;
            if let Err(e) = cache.flush_stats() {
                warn!(error = %e, "Failed to persist cache stats");
            }
        }
        debug!("Builder shut down");
    }

    fn ensure_optimizer(&self) {
        let Ok(mut slot) = self.optimizer.lock() else { return };
        if slot.is_none() {
            let token = CancellationToken::new();
            let handle = self.resources.spawn_optimizer(token.clone());
            *slot = Some((token, handle));
        }
    }

    /// Runs one build. Never fails: errors are folded into the result.
    #[instrument(skip_all, fields(build_id = tracing::field::Empty))]
    pub async fn build(&self, config: &BuildConfig, cancel: &CancellationToken) -> BuildOutcome {
        let started = Instant::now();
        let build_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        tracing::Span::current().record("build_id", build_id.as_str());
        self.ensure_optimizer();

        info!(context = %config.context_path.display(), "Starting build");
        self.events.publish(Event::new(EventType::BuildStarted, &build_id, "Build started"));

        let collector = Arc::new(MetricsCollector::new());
        let run = self.run(config, &build_id, &collector, cancel);
        let (mut result, artifact, cache) = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(done) => done,
                Err(_) => {
                    let err = KilnError::Timeout { scope: "build".to_string(), after: limit };
                    (BuildResult::failed(&err), None, None)
                }
            },
            None => run.await,
        };
        result.duration = started.elapsed();

        if let Some(kind) = result.error_kind {
            collector.record_error(kind.as_str());
        }
        metrics::record_build(
            result.duration.as_secs_f64(),
            result.success,
            result.error_kind.map(|k| k.as_str()),
        );

        let cache_stats = match &cache {
            Some(cache) => {
                if let Err(e) = cache.flush_stats() {
                    warn!(error = %e, "Failed to persist cache stats");
                }
                cache.stats()
            }
            None => Default::default(),
        };
        let profiles = self
            .resources
            .profiler()
            .snapshot()
            .into_iter()
            .map(|(op_type, profile)| (op_type.as_str().to_string(), profile))
            .collect();
        let report = BuildReport::new(
            &build_id,
            &result,
            collector.snapshot(),
            profiles,
            cache_stats,
            self.resources.peak_active_ops(),
        );
        report.log();

        let (event_type, message) = if result.success {
            (EventType::BuildCompleted, "Build completed".to_string())
        } else {
            (EventType::BuildFailed, result.error.clone().unwrap_or_default())
        };
        self.events.publish(
            Event::new(event_type, &build_id, &message).with_metadata("duration_ms", result.duration.as_millis()),
        );

        BuildOutcome { result, report, artifact }
    }

    async fn run(
        &self,
        config: &BuildConfig,
        build_id: &str,
        collector: &Arc<MetricsCollector>,
        cancel: &CancellationToken,
    ) -> (BuildResult, Option<PathBuf>, Option<CacheEngine>) {
        let prepared = match self.prepare(config).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(error = %err, kind = %err.kind(), "Build preparation failed");
                return (BuildResult::failed(&err), None, None);
            }
        };

        let mut result = self.execute_platforms(config, &prepared, collector, cancel).await;
        result.metadata = build_metadata(config, &prepared);

        let mut artifact = None;
        if result.success {
            match self.export(config, &result, prepared.work_dir.path(), build_id).await {
                Ok(path) => {
                    self.events.publish(
                        Event::new(EventType::ExportCompleted, build_id, "Export completed")
                            .with_metadata("path", path.display()),
                    );
                    artifact = Some(path);
                }
                Err(err) => {
                    error!(error = %err, "Export failed");
                    self.events.publish(Event::new(EventType::ExportFailed, build_id, &err.to_string()));
                    result.success = false;
                    result.error = Some(err.to_string());
                    result.error_kind = Some(err.kind());
                }
            }
        }
        if config.push && result.success {
            info!(registry = ?config.registry.cache_ref, "Push is delegated to the registry-aware executor");
        }

        (result, artifact, Some(prepared.cache))
    }

    /// Steps 1-3: everything that can fail before an operation runs.
    async fn prepare(&self, config: &BuildConfig) -> Result<Prepared> {
        if !config.context_path.is_dir() {
            return Err(KilnError::ReadFailed {
                path: config.context_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "build context is not a directory"),
            });
        }
        let cache_dir = config.cache_dir.clone().unwrap_or_else(|| self.options.cache_dir.clone());
        let cache = self.cache(&cache_dir)?;

        std::fs::create_dir_all(&self.options.work_root)
            .map_err(|e| KilnError::Io { path: self.options.work_root.clone(), source: e })?;
        let work_dir = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(&self.options.work_root)
            .map_err(|e| KilnError::Io { path: self.options.work_root.clone(), source: e })?;

        let dockerfile_path = config.resolved_dockerfile();
        let text = std::fs::read_to_string(&dockerfile_path)
            .map_err(|e| KilnError::ReadFailed { path: dockerfile_path.clone(), source: e })?;
        let dockerfile_hash = sha256_hex(text.as_bytes());

        let context_hash = {
            let context = config.context_path.clone();
            let mut ignore = IgnorePatterns::new(config.ignore_patterns.iter());
            let cache_rel = cache_dir
                .strip_prefix(&context)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"));
            tokio::task::spawn_blocking(move || {
                ignore.load_dockerignore(&context)?;
                if let Some(rel) = cache_rel.filter(|r| !r.is_empty()) {
                    ignore.exclude_path(&rel);
                }
                compute_context_hash(&context, &ignore)
            })
            .await
            .map_err(|e| KilnError::Internal(format!("context hashing task failed: {}", e)))??
        };
        debug!(%dockerfile_hash, %context_hash, "Hashed build inputs");

        let operations = frontend::parse(&text, config)?;
        let platforms = config.effective_platforms();
        let mut graphs = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let ops = operations.iter().map(|op| op.for_platform(&platform)).collect();
            let graph = BuildGraph::solve(ops)?;
            debug!(platform = %platform, nodes = graph.len(), levels = graph.levels.len(), "Solved build graph");
            graphs.push((platform, Arc::new(graph)));
        }

        Ok(Prepared { work_dir, cache, dockerfile_hash, context_hash, graphs })
    }

    fn executor_for(&self, config: &BuildConfig) -> Result<Arc<dyn Executor>> {
        if let Some(executor) = &self.executor {
            return Ok(Arc::clone(executor));
        }
        let kind = if config.rootless { ExecutorKind::Rootless } else { self.options.executor };
        create_executor(kind, &config.context_path)
    }

    /// Step 4: one scheduler run per platform.
    async fn execute_platforms(
        &self,
        config: &BuildConfig,
        prepared: &Prepared,
        collector: &Arc<MetricsCollector>,
        cancel: &CancellationToken,
    ) -> BuildResult {
        let executor = match self.executor_for(config) {
            Ok(executor) => executor,
            Err(err) => return BuildResult::failed(&err),
        };

        let multi_arch = prepared.graphs.len() > 1;
        let mode = if config.pipelined && !multi_arch { DispatchMode::Pipelined } else { DispatchMode::Level };
        let limits = config.resources.clone().unwrap_or_else(|| self.options.limits.clone());

        let jobs: Vec<PlatformJob> = prepared
            .graphs
            .iter()
            .map(|(platform, graph)| PlatformJob {
                graph: Arc::clone(graph),
                cancel: cancel.clone(),
                resources: Arc::clone(&self.resources),
                ctx: SchedulerContext {
                    platform: platform.clone(),
                    cache: prepared.cache.clone(),
                    resources: Arc::clone(&self.resources),
                    executor: Arc::clone(&executor),
                    events: self.events.clone(),
                    collector: Arc::clone(collector),
                    dockerfile_hash: prepared.dockerfile_hash.clone(),
                    context_hash: prepared.context_hash.clone(),
                    work_dir: prepared.work_dir.path().join(platform.cache_dir_name()),
                    config: SchedulerConfig {
                        mode,
                        max_concurrent_ops: limits.max_concurrent_ops,
                        op_timeout: self.options.op_timeout,
                        stage_timeout: self.options.stage_timeout,
                        no_cache: config.no_cache,
                    },
                },
            })
            .collect();

        let mut platform_results = BTreeMap::new();
        if config.parallel_platforms && multi_arch {
            let mut tasks = tokio::task::JoinSet::new();
            for job in jobs {
                tasks.spawn(job.run());
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((platform, result)) => {
                        platform_results.insert(platform, result);
                    }
                    Err(e) => error!(error = %e, "Per-platform build task failed"),
                }
            }
        } else {
            for job in jobs {
                let (platform, result) = job.run().await;
                platform_results.insert(platform, result);
            }
        }

        aggregate(platform_results, multi_arch, prepared.graphs.len())
    }

    /// Step 5.
    async fn export(&self, config: &BuildConfig, result: &BuildResult, work_dir: &Path, build_id: &str) -> Result<PathBuf> {
        let destination = config.output_path.clone().unwrap_or_else(|| {
            let name = config.tags.first().map(|t| sanitize_tag(t)).unwrap_or_else(|| build_id.to_string());
            self.options.output_dir.join(name)
        });

        let exporter = Arc::clone(&self.exporter);
        let (result, config, work_dir) = (result.clone(), config.clone(), work_dir.to_path_buf());
        tokio::task::spawn_blocking(move || exporter.export(&result, &config, &work_dir, &destination))
            .await
            .map_err(|e| KilnError::ExportFailed { reason: format!("export task failed: {}", e) })?
    }
}

/// One per-platform build, owned so it can run on its own task.
struct PlatformJob {
    graph: Arc<BuildGraph>,
    cancel: CancellationToken,
    resources: Arc<ResourceManager>,
    ctx: SchedulerContext,
}

impl PlatformJob {
    async fn run(self) -> (String, PlatformResult) {
        let platform = self.ctx.platform.to_string();
        let started = Instant::now();
        let events = self.ctx.events.clone();
        let work_dir = self.ctx.work_dir.clone();

        let result = match self.schedule(&work_dir).await {
            Ok(result) => result,
            Err(err) => PlatformResult {
                success: false,
                error: Some(err.to_string()),
                error_kind: Some(err.kind()),
                ..Default::default()
            },
        };
        let result = PlatformResult { duration: started.elapsed(), ..result };
        metrics::record_platform_build(&platform, result.duration.as_secs_f64());

        let event = match &result.error {
            None => Event::new(EventType::PlatformCompleted, &platform, "Platform build completed")
                .with_metadata("cache_hits", result.cache_hits),
            Some(error) => {
                warn!(platform = %platform, %error, "Platform build failed");
                Event::new(EventType::PlatformFailed, &platform, error)
            }
        };
        events.publish(event);
        (platform, result)
    }

    async fn schedule(self, work_dir: &Path) -> Result<PlatformResult> {
        let _permit = self.resources.acquire_build(None, &self.cancel).await?;
        std::fs::create_dir_all(work_dir).map_err(|e| KilnError::Io { path: work_dir.to_path_buf(), source: e })?;

        let platform = self.ctx.platform.to_string();
        self.ctx.events.publish(
            Event::new(EventType::PlatformStarted, &platform, "Platform build started")
                .with_metadata("operations", self.graph.len()),
        );

        let graph = Arc::clone(&self.graph);
        let report = Scheduler::new(self.ctx).run(Arc::clone(&graph), &self.cancel).await;

        let image_id = report.success().then(|| format!("sha256:{}", sha256_hex(graph.ordered_keys().join("\n").as_bytes())));
        Ok(PlatformResult {
            success: report.success(),
            image_id,
            error: report.failure.as_ref().map(|e| e.to_string()),
            error_kind: report.failure.as_ref().map(|e| e.kind()),
            operations: report.completed,
            cache_hits: report.cache_hits,
            duration: report.duration,
        })
    }
}

/// Folds per-platform results into the build result.
fn aggregate(platform_results: BTreeMap<String, PlatformResult>, multi_arch: bool, expected: usize) -> BuildResult {
    let mut result = BuildResult {
        success: platform_results.len() == expected && platform_results.values().all(|r| r.success),
        multi_arch,
        operations: platform_results.values().map(|r| r.operations).sum(),
        cache_hits: platform_results.values().map(|r| r.cache_hits).sum(),
        ..Default::default()
    };

    if result.success {
        if multi_arch {
            let mut ids: Vec<&str> = platform_results.values().filter_map(|r| r.image_id.as_deref()).collect();
            ids.sort_unstable();
            result.manifest_list_id = Some(format!("sha256:{}", sha256_hex(ids.join("\n").as_bytes())));
        }
    } else {
        let failed: Vec<&str> = platform_results.iter().filter(|(_, r)| !r.success).map(|(p, _)| p.as_str()).collect();
        result.error = Some(if failed.is_empty() {
            "build failed: per-platform build did not finish".to_string()
        } else {
            format!("build failed for platforms: {}", failed.join(", "))
        });
        result.error_kind = ErrorKind::most_severe(platform_results.values().filter_map(|r| r.error_kind))
            .or(Some(ErrorKind::Executor));
    }

    result.platform_results = platform_results;
    result
}

/// Deterministic facts about the build inputs.
fn build_metadata(config: &BuildConfig, prepared: &Prepared) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("dockerfile_hash".to_string(), prepared.dockerfile_hash.clone());
    metadata.insert("context_hash".to_string(), prepared.context_hash.clone());
    let platforms: Vec<String> = prepared.graphs.iter().map(|(p, _)| p.to_string()).collect();
    metadata.insert("platforms".to_string(), platforms.join(","));
    metadata.insert("output".to_string(), config.output.as_str().to_string());
    if !config.tags.is_empty() {
        metadata.insert("tags".to_string(), config.tags.join(","));
    }
    if let Some(target) = &config.target {
        metadata.insert("target".to_string(), target.clone());
    }
    metadata
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_result(success: bool, kind: Option<ErrorKind>, id: &str) -> PlatformResult {
        PlatformResult {
            success,
            image_id: success.then(|| id.to_string()),
            error: kind.map(|k| format!("{} failure", k)),
            error_kind: kind,
            operations: 2,
            cache_hits: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_success() {
        let mut results = BTreeMap::new();
        results.insert("linux/amd64".to_string(), platform_result(true, None, "sha256:b"));
        results.insert("linux/arm64".to_string(), platform_result(true, None, "sha256:a"));

        let result = aggregate(results.clone(), true, 2);
        assert!(result.success);
        assert_eq!((result.operations, result.cache_hits), (4, 2));
        let id = result.manifest_list_id.clone().unwrap();

        // Independent of platform order
        let reordered: BTreeMap<_, _> = results.into_iter().rev().collect();
        assert_eq!(aggregate(reordered, true, 2).manifest_list_id.unwrap(), id);
    }

    #[test]
    fn test_aggregate_partial_failure() {
        let mut results = BTreeMap::new();
        results.insert("linux/amd64".to_string(), platform_result(true, None, "sha256:a"));
        results.insert("linux/arm64".to_string(), platform_result(false, Some(ErrorKind::Executor), ""));
        results.insert("linux/s390x".to_string(), platform_result(false, Some(ErrorKind::Timeout), ""));

        let result = aggregate(results, true, 3);
        assert!(!result.success);
        assert!(result.manifest_list_id.is_none());
        assert_eq!(result.error.as_deref(), Some("build failed for platforms: linux/arm64, linux/s390x"));
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.failed_platforms(), vec!["linux/arm64", "linux/s390x"]);
    }

    #[test]
    fn test_aggregate_missing_platform() {
        let mut results = BTreeMap::new();
        results.insert("linux/amd64".to_string(), platform_result(true, None, "sha256:a"));
        assert!(!aggregate(results, true, 2).success);
    }

    #[test]
    fn test_options_from_settings() {
        let settings = Settings { cache_max_files: Some(100), op_timeout_secs: 5, ..Default::default() };
        let options = BuilderOptions::from_settings(&settings);
        assert_eq!(options.prune_strategy.max_files, Some(100));
        assert!(options.prune_strategy.lru_enabled);
        assert_eq!(options.op_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("registry.io/app:1.2"), "registry.io_app_1.2");
    }
}
