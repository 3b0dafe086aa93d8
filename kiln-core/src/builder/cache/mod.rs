//! Content-addressed, platform-aware build cache.
//!
//! Entries are JSON-serialized [`CacheEntry`] records laid out as
//!
//! ```text
//! <base>/platforms/<os_arch[_variant]>/<key[0:2]>/<key[2:4]>/<key>   pull, extract, exec
//! <base>/shared/<key[0:2]>/<key[2:4]>/<key>                          file, meta
//! <base>/metadata/stats.json                                         counters
//! ```
//!
//! Writes are atomic (temp file + rename). Enumeration and victim selection
//! for pruning and invalidation happen under one mutex; deletions happen
//! outside it.

pub mod entry;
pub mod hash;
pub mod prune;
pub mod rules;
pub mod stats;

pub use entry::{CacheEntry, StorageClass};
pub use hash::{compute_context_hash, compute_dockerfile_hash, IgnorePatterns};
pub use prune::{PruneReason, PruneReport, PruneStrategy};
pub use rules::{default_rules, InvalidationRule};
pub use stats::CacheStats;

use crate::types::{OperationResult, Platform};
use entry::{entry_path, is_temp_file, now_millis, read_entry, validate_key, write_entry};
use prune::PruneCandidate;
use rules::{first_rejection, RuleContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Valid entry found; the result has `cache_hit` set
    Hit(OperationResult),
    /// Absent, invalidated or unreadable
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Entry counts and sizes of one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub entries: usize,
    pub bytes: u64,
}

/// Snapshot returned by [`CacheEngine::info`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub base_dir: PathBuf,
    pub entries: usize,
    pub total_bytes: u64,
    pub shared: PartitionInfo,
    pub platforms: BTreeMap<String, PartitionInfo>,
    pub stats: CacheStats,
}

/// The cache engine. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct CacheEngine {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    base: PathBuf,
    rules: Vec<InvalidationRule>,
    strategy: PruneStrategy,
    /// Held for enumeration and selection only
    index_lock: Mutex<()>,
    stats: Mutex<CacheStats>,
    /// Outputs of entries this instance removed
    removed_outputs: Mutex<HashSet<String>>,
    approx_bytes: AtomicU64,
    approx_files: AtomicU64,
    prune_in_flight: AtomicBool,
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Locks a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CacheEngine {
    /// Opens (creating if needed) a cache with default rules and strategy.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::with_config(base, default_rules(), PruneStrategy::default())
    }

    /// Opens a cache with explicit invalidation rules and pruning strategy.
    pub fn with_config(
        base: impl Into<PathBuf>,
        rules: Vec<InvalidationRule>,
        strategy: PruneStrategy,
    ) -> Result<Self, CacheError> {
        let base = base.into();
        for dir in [entry::PLATFORMS_DIR, entry::SHARED_DIR, entry::METADATA_DIR] {
            fs::create_dir_all(base.join(dir)).map_err(|e| {
                CacheError::CacheDirectoryError(format!("Failed to create {}: {}", base.join(dir).display(), e))
            })?;
        }

        let stats = CacheStats::load(&base.join(entry::METADATA_DIR));
        let inner = CacheInner {
            base,
            rules,
            strategy,
            index_lock: Mutex::new(()),
            stats: Mutex::new(stats),
            removed_outputs: Mutex::new(HashSet::new()),
            approx_bytes: AtomicU64::new(0),
            approx_files: AtomicU64::new(0),
            prune_in_flight: AtomicBool::new(false),
            background: Mutex::new(None),
        };

        let (files, bytes) = inner
            .entry_files()
            .iter()
            .fold((0u64, 0u64), |(n, b), (_, len)| (n + 1, b + len));
        inner.approx_files.store(files, Ordering::Relaxed);
        inner.approx_bytes.store(bytes, Ordering::Relaxed);

        debug!(base = %inner.base.display(), entries = files, bytes, "Opened build cache");
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base
    }

    pub fn strategy(&self) -> &PruneStrategy {
        &self.inner.strategy
    }

    /// Looks up `key`, platform partition first, then shared.
    ///
    /// Entries rejected by an invalidation rule, and entries that fail to
    /// deserialize, are deleted and reported as a miss.
    #[instrument(skip(self, platform, dockerfile_hash, context_hash), fields(platform = %platform))]
    pub fn get(
        &self,
        key: &str,
        platform: &Platform,
        dockerfile_hash: &str,
        context_hash: &str,
    ) -> Result<CacheLookup, CacheError> {
        validate_key(key)?;
        let platform_name = platform.to_string();

        let candidates = [
            entry_path(&self.inner.base, key, &StorageClass::Platform(platform.cache_dir_name())),
            entry_path(&self.inner.base, key, &StorageClass::Shared),
        ];

        for path in candidates {
            let mut entry = match read_entry(&path) {
                Ok(entry) => entry,
                Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(CacheError::Serialization(e)) => {
                    warn!(path = %path.display(), error = %e, "Removing malformed cache entry");
                    self.inner.remove_file(&path);
                    lock(&self.inner.stats).malformed += 1;
                    self.inner.record_miss(&platform_name);
                    return Ok(CacheLookup::Miss);
                }
                Err(e) => return Err(e),
            };

            let removed = lock(&self.inner.removed_outputs).clone();
            let ctx = RuleContext {
                now_ms: now_millis(),
                dockerfile_hash,
                context_hash,
                removed_outputs: &removed,
            };
            if let Some(rule) = first_rejection(&self.inner.rules, &entry, &ctx) {
                debug!(key, rule = rule.name(), "Cache entry invalidated");
                self.inner.remove_entry(&path, &entry);
                lock(&self.inner.stats).invalidations += 1;
                self.inner.record_miss(&platform_name);
                return Ok(CacheLookup::Miss);
            }

            // Access bookkeeping is best-effort
            entry.last_accessed = now_millis();
            entry.access_count += 1;
            if let Err(e) = write_entry(&path, &entry) {
                debug!(key, error = %e, "Failed to update cache access time");
            }

            lock(&self.inner.stats).record_hit(&platform_name);
            let mut result = entry.result;
            result.cache_hit = true;
            return Ok(CacheLookup::Hit(result));
        }

        self.inner.record_miss(&platform_name);
        Ok(CacheLookup::Miss)
    }

    /// Stores `result` under `key`.
    ///
    /// The partition is chosen by the operation type. May schedule a
    /// background prune when the strategy's size or count limit is exceeded.
    #[instrument(
        skip(self, result, platform, dockerfile_hash, context_hash, dependencies),
        fields(platform = %platform)
    )]
    pub fn set(
        &self,
        key: &str,
        result: &OperationResult,
        platform: &Platform,
        dockerfile_hash: &str,
        context_hash: &str,
        dependencies: &[String],
    ) -> Result<(), CacheError> {
        validate_key(key)?;

        let outcome = self.write(key, result, platform, dockerfile_hash, context_hash, dependencies);
        match &outcome {
            Ok(written) => {
                let written = *written;
                lock(&self.inner.stats).record_set(&platform.to_string(), written);
                {
                    let mut removed = lock(&self.inner.removed_outputs);
                    for output in &result.operation.outputs {
                        removed.remove(output);
                    }
                }
                let files = self.inner.approx_files.fetch_add(1, Ordering::Relaxed) + 1;
                let bytes = self.inner.approx_bytes.fetch_add(written, Ordering::Relaxed) + written;
                if self.inner.strategy.exceeded_by(bytes, files as usize) {
                    self.schedule_prune();
                }
            }
            Err(e) => {
                lock(&self.inner.stats).set_failures += 1;
                warn!(key, error = %e, "Failed to write cache entry");
            }
        }
        outcome.map(|_| ())
    }

    fn write(
        &self,
        key: &str,
        result: &OperationResult,
        platform: &Platform,
        dockerfile_hash: &str,
        context_hash: &str,
        dependencies: &[String],
    ) -> Result<u64, CacheError> {
        let mut stored = result.clone();
        stored.cache_hit = false;
        let size = serde_json::to_vec(&stored)?.len() as u64;

        let now = now_millis();
        let entry = CacheEntry {
            key: key.to_string(),
            result: stored,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            platform: platform.clone(),
            dockerfile_hash: dockerfile_hash.to_string(),
            context_hash: context_hash.to_string(),
            dependencies: dependencies.to_vec(),
            size,
        };

        let path = entry_path(&self.inner.base, key, &entry.storage_class());
        let written = write_entry(&path, &entry)?;
        debug!(key, path = %path.display(), bytes = written, "Cached operation result");
        Ok(written)
    }

    /// Removes every entry whose Dockerfile hash differs from `hash`.
    #[instrument(skip(self))]
    pub fn invalidate_by_dockerfile(&self, hash: &str) -> Result<usize, CacheError> {
        self.invalidate_where(|entry| entry.dockerfile_hash != hash)
    }

    /// Removes every entry whose build-context hash differs from `hash`.
    #[instrument(skip(self))]
    pub fn invalidate_by_context(&self, hash: &str) -> Result<usize, CacheError> {
        self.invalidate_where(|entry| entry.context_hash != hash)
    }

    fn invalidate_where<F>(&self, predicate: F) -> Result<usize, CacheError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let victims: Vec<(PathBuf, Option<CacheEntry>)> = {
            let _guard = lock(&self.inner.index_lock);
            self.inner
                .entry_files()
                .into_iter()
                .filter_map(|(path, _)| match read_entry(&path) {
                    Ok(entry) if predicate(&entry) => Some((path, Some(entry))),
                    Ok(_) => None,
                    Err(_) => Some((path, None)),
                })
                .collect()
        };

        let mut removed = 0;
        for (path, entry) in &victims {
            let deleted = match entry {
                Some(entry) => self.inner.remove_entry(path, entry),
                None => self.inner.remove_file(path),
            };
            if deleted {
                removed += 1;
            }
        }

        if removed > 0 {
            lock(&self.inner.stats).invalidations += removed as u64;
            self.inner.remove_empty_dirs();
            info!(removed, "Invalidated cache entries");
        }
        Ok(removed)
    }

    /// Prunes with the cache's configured strategy.
    pub fn prune_default(&self) -> Result<PruneReport, CacheError> {
        self.inner.prune(&self.inner.strategy)
    }

    /// Removes entries until every limit of `strategy` holds.
    pub fn prune(&self, strategy: &PruneStrategy) -> Result<PruneReport, CacheError> {
        self.inner.prune(strategy)
    }

    /// Starts a background prune unless one is already running.
    fn schedule_prune(&self) {
        if self
            .inner
            .prune_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let task = move || {
            if let Err(e) = inner.prune(&inner.strategy) {
                warn!(error = %e, "Background cache prune failed");
            }
            inner.prune_in_flight.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Scheduling background cache prune");
                let join = handle.spawn_blocking(task);
                *lock(&self.inner.background) = Some(join);
            }
            Err(_) => task(),
        }
    }

    /// Waits for an in-flight background prune, if any.
    pub async fn join_background(&self) {
        let handle = lock(&self.inner.background).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background cache prune panicked");
            }
        }
    }

    /// Entry counts and sizes per partition, plus counters.
    pub fn info(&self) -> Result<CacheInfo, CacheError> {
        let files = {
            let _guard = lock(&self.inner.index_lock);
            self.inner.entry_files()
        };

        let platforms_root = self.inner.base.join(entry::PLATFORMS_DIR);
        let mut info = CacheInfo {
            base_dir: self.inner.base.clone(),
            entries: 0,
            total_bytes: 0,
            shared: PartitionInfo::default(),
            platforms: BTreeMap::new(),
            stats: self.stats(),
        };

        for (path, len) in files {
            info.entries += 1;
            info.total_bytes += len;
            let partition = match path.strip_prefix(&platforms_root) {
                Ok(rel) => {
                    let dir = rel
                        .components()
                        .next()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .unwrap_or_default();
                    info.platforms.entry(dir).or_default()
                }
                Err(_) => &mut info.shared,
            };
            partition.entries += 1;
            partition.bytes += len;
        }

        Ok(info)
    }

    /// Deletes every entry and resets the counters.
    #[instrument(skip(self))]
    pub fn clear(&self) -> Result<usize, CacheError> {
        let _guard = lock(&self.inner.index_lock);
        let count = self.inner.entry_files().len();

        for dir in [entry::PLATFORMS_DIR, entry::SHARED_DIR] {
            let path = self.inner.base.join(dir);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&path)?;
        }

        *lock(&self.inner.stats) = CacheStats::default();
        self.inner.approx_files.store(0, Ordering::Relaxed);
        self.inner.approx_bytes.store(0, Ordering::Relaxed);
        self.inner.save_stats()?;

        info!(removed = count, "Cleared build cache");
        Ok(count)
    }

    /// Clone of the current counters.
    pub fn stats(&self) -> CacheStats {
        lock(&self.inner.stats).clone()
    }

    /// Persists the counters to `metadata/stats.json`.
    pub fn flush_stats(&self) -> Result<(), CacheError> {
        self.inner.save_stats()
    }
}

impl CacheInner {
    /// All entry files with their on-disk length. Temp files are skipped.
    fn entry_files(&self) -> Vec<(PathBuf, u64)> {
        let mut files = Vec::new();
        for dir in [entry::PLATFORMS_DIR, entry::SHARED_DIR] {
            let walker = WalkDir::new(self.base.join(dir)).sort_by_file_name().into_iter();
            for item in walker.filter_map(|e| e.ok()) {
                if !item.file_type().is_file() || is_temp_file(item.path()) {
                    continue;
                }
                let len = item.metadata().map(|m| m.len()).unwrap_or(0);
                files.push((item.into_path(), len));
            }
        }
        files
    }

    fn record_miss(&self, platform: &str) {
        lock(&self.stats).record_miss(platform);
    }

    fn remove_file(&self, path: &Path) -> bool {
        let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(path) {
            Ok(()) => {
                self.approx_files.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1))).ok();
                self.approx_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(len))).ok();
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                false
            }
        }
    }

    fn remove_entry(&self, path: &Path, entry: &CacheEntry) -> bool {
        let removed = self.remove_file(path);
        if removed {
            lock(&self.removed_outputs).extend(entry.outputs().iter().cloned());
        }
        removed
    }

    fn prune(&self, strategy: &PruneStrategy) -> Result<PruneReport, CacheError> {
        let now = now_millis();

        // Enumerate and select under the lock
        let (candidates, malformed, selected) = {
            let _guard = lock(&self.index_lock);
            let mut candidates = Vec::new();
            let mut malformed = Vec::new();
            for (path, len) in self.entry_files() {
                match read_entry(&path) {
                    Ok(entry) => candidates.push(PruneCandidate {
                        key: entry.key.clone(),
                        class: entry.storage_class(),
                        size: len,
                        created_at: entry.created_at,
                        last_accessed: entry.last_accessed,
                        outputs: entry.outputs().to_vec(),
                        dependencies: entry.dependencies,
                        path,
                    }),
                    Err(_) => malformed.push((path, len)),
                }
            }
            let selected = prune::select(&candidates, strategy, now);
            (candidates, malformed, selected)
        };

        let mut report = PruneReport { scanned: candidates.len() + malformed.len(), ..Default::default() };

        // Delete without the lock
        for (path, len) in &malformed {
            if self.remove_file(path) {
                report.removed += 1;
                report.bytes_freed += len;
                *report.by_reason.entry(PruneReason::Malformed.as_str().to_string()).or_default() += 1;
            }
        }

        let mut removed_idx = HashSet::new();
        for (idx, reason) in &selected {
            let candidate = &candidates[*idx];
            if self.remove_file(&candidate.path) {
                removed_idx.insert(*idx);
                report.removed += 1;
                report.bytes_freed += candidate.size;
                *report.by_reason.entry(reason.as_str().to_string()).or_default() += 1;
                lock(&self.removed_outputs).extend(candidate.outputs.iter().cloned());
            } else {
                report.failed_deletions += 1;
            }
        }

        for (idx, candidate) in candidates.iter().enumerate() {
            if !removed_idx.contains(&idx) {
                report.remaining_entries += 1;
                report.remaining_bytes += candidate.size;
            }
        }

        self.remove_empty_dirs();
        self.approx_files.store(report.remaining_entries as u64, Ordering::Relaxed);
        self.approx_bytes.store(report.remaining_bytes, Ordering::Relaxed);
        {
            let mut stats = lock(&self.stats);
            stats.evictions += report.removed as u64;
            stats.prune_runs += 1;
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            bytes_freed = report.bytes_freed,
            remaining = report.remaining_entries,
            "Pruned build cache"
        );
        Ok(report)
    }

    /// Removes empty shard and platform directories, deepest first.
    /// Takes the index lock so a concurrent `set` never loses its shard directory.
    fn remove_empty_dirs(&self) {
        let _guard = lock(&self.index_lock);
        for dir in [entry::PLATFORMS_DIR, entry::SHARED_DIR] {
            let root = self.base.join(dir);
            let walker = WalkDir::new(&root).min_depth(1).contents_first(true).into_iter();
            for item in walker.filter_map(|e| e.ok()) {
                if item.file_type().is_dir() {
                    // Fails harmlessly on non-empty directories
                    let _ = fs::remove_dir(item.path());
                }
            }
        }
    }

    fn save_stats(&self) -> Result<(), CacheError> {
        let stats = lock(&self.stats).clone();
        stats.save(&self.base.join(entry::METADATA_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, OperationType};
    use std::time::Duration;
    use tempfile::TempDir;

    fn amd64() -> Platform {
        Platform::new("linux", "amd64", None)
    }

    fn result(op_type: OperationType, name: &str) -> OperationResult {
        let mut op = Operation::new(op_type, vec![name.to_string()], amd64());
        op.outputs = vec![format!("{}-out", name)];
        OperationResult::succeeded(&op, vec![format!("{}-artifact", name)])
    }

    fn key(n: u32) -> String {
        format!("{:064x}", n)
    }

    fn files_under(dir: &Path) -> usize {
        WalkDir::new(dir).into_iter().filter_map(|e| e.ok()).filter(|e| e.file_type().is_file()).count()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        let stored = result(OperationType::Exec, "run");

        assert_eq!(cache.get(&key(1), &amd64(), "df", "ctx").unwrap(), CacheLookup::Miss);
        cache.set(&key(1), &stored, &amd64(), "df", "ctx", &[]).unwrap();

        match cache.get(&key(1), &amd64(), "df", "ctx").unwrap() {
            CacheLookup::Hit(hit) => {
                assert!(hit.cache_hit);
                assert_eq!(hit.outputs, stored.outputs);
                assert_eq!(hit.operation, stored.operation);
            }
            CacheLookup::Miss => panic!("Expected cache hit"),
        }

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
        assert_eq!(stats.platforms["linux/amd64"].hits, 1);
    }

    #[test]
    fn test_storage_partition() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();

        cache.set(&key(1), &result(OperationType::Exec, "run"), &amd64(), "df", "ctx", &[]).unwrap();
        assert_eq!(files_under(&dir.path().join("platforms/linux_amd64")), 1);
        assert_eq!(files_under(&dir.path().join("shared")), 0);

        cache.set(&key(2), &result(OperationType::File, "copy"), &amd64(), "df", "ctx", &[]).unwrap();
        assert_eq!(files_under(&dir.path().join("platforms")), 1);
        assert_eq!(files_under(&dir.path().join("shared")), 1);
        assert!(dir.path().join("shared").join(&key(2)[0..2]).join(&key(2)[2..4]).join(key(2)).is_file());

        // Shared entries are visible from any platform
        let arm = Platform::new("linux", "arm64", None);
        assert!(cache.get(&key(2), &arm, "df", "ctx").unwrap().is_hit());
        assert!(!cache.get(&key(1), &arm, "df", "ctx").unwrap().is_hit());
    }

    #[test]
    fn test_context_change_removes_entry() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        cache.set(&key(7), &result(OperationType::Exec, "run"), &amd64(), "df", "ctx-1", &[]).unwrap();

        assert_eq!(cache.get(&key(7), &amd64(), "df", "ctx-2").unwrap(), CacheLookup::Miss);
        assert_eq!(cache.get(&key(7), &amd64(), "df", "ctx-1").unwrap(), CacheLookup::Miss);
        assert_eq!(files_under(&dir.path().join("platforms")), 0);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_dependency_rule_after_removal() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        let parent = result(OperationType::Pull, "pull");
        let child = result(OperationType::Exec, "run");

        cache.set(&key(1), &parent, &amd64(), "df", "ctx", &[]).unwrap();
        cache.set(&key(2), &child, &amd64(), "df", "ctx", &parent.operation.outputs).unwrap();

        // Parent disappears through a context mismatch
        assert!(!cache.get(&key(1), &amd64(), "df", "other").unwrap().is_hit());
        assert!(!cache.get(&key(2), &amd64(), "df", "ctx").unwrap().is_hit());

        // Re-producing the parent output clears the mark
        cache.set(&key(1), &parent, &amd64(), "df", "ctx", &[]).unwrap();
        cache.set(&key(2), &child, &amd64(), "df", "ctx", &parent.operation.outputs).unwrap();
        assert!(cache.get(&key(2), &amd64(), "df", "ctx").unwrap().is_hit());
    }

    #[test]
    fn test_malformed_entry_is_miss_and_deleted() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        let k = key(9);
        let path = entry_path(dir.path(), &k, &StorageClass::Shared);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();

        assert_eq!(cache.get(&k, &amd64(), "df", "ctx").unwrap(), CacheLookup::Miss);
        assert!(!path.exists());
        assert_eq!(cache.stats().malformed, 1);
    }

    #[test]
    fn test_invalid_cache_key() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();

        let result = cache.set("invalid key!", &result(OperationType::Meta, "m"), &amd64(), "", "", &[]);
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
        assert!(cache.get("../x", &amd64(), "", "").is_err());
    }

    #[test]
    fn test_invalidate_by_hashes() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "df-1", "ctx-1", &[]).unwrap();
        cache.set(&key(2), &result(OperationType::Meta, "b"), &amd64(), "df-2", "ctx-1", &[]).unwrap();
        cache.set(&key(3), &result(OperationType::File, "c"), &amd64(), "df-2", "ctx-2", &[]).unwrap();

        assert_eq!(cache.invalidate_by_dockerfile("df-2").unwrap(), 1);
        assert_eq!(cache.invalidate_by_context("ctx-2").unwrap(), 1);
        assert_eq!(cache.info().unwrap().entries, 1);
        assert!(cache.get(&key(3), &amd64(), "df-2", "ctx-2").unwrap().is_hit());
    }

    #[test]
    fn test_invalidation_counts_only_deleted_files() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "df-old", "ctx", &[]).unwrap();
        cache.set(&key(2), &result(OperationType::File, "b"), &amd64(), "df-old", "ctx", &[]).unwrap();
        cache.set(&key(3), &result(OperationType::Exec, "c"), &amd64(), "df-new", "ctx", &[]).unwrap();
        let junk = dir.path().join("shared/ff/ff/ffff");
        fs::create_dir_all(junk.parent().unwrap()).unwrap();
        fs::write(&junk, b"not json").unwrap();

        let removed = cache.invalidate_by_dockerfile("df-new").unwrap();
        assert_eq!(removed, 3);
        assert_eq!(cache.stats().invalidations, 3);
        assert_eq!(cache.info().unwrap().entries, 1);

        // Nothing left to delete, nothing counted
        assert_eq!(cache.invalidate_by_dockerfile("df-new").unwrap(), 0);
        assert_eq!(cache.stats().invalidations, 3);
    }

    #[test]
    fn test_set_after_sweep_recreates_shard() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        let stored = result(OperationType::Exec, "a");
        cache.set(&key(1), &stored, &amd64(), "df-1", "ctx", &[]).unwrap();

        assert_eq!(cache.invalidate_by_dockerfile("df-2").unwrap(), 1);
        let shard = dir.path().join("platforms/linux_amd64").join(&key(1)[0..2]);
        assert!(!shard.exists());

        cache.set(&key(1), &stored, &amd64(), "df-2", "ctx", &[]).unwrap();
        assert!(cache.get(&key(1), &amd64(), "df-2", "ctx").unwrap().is_hit());
    }

    #[test]
    fn test_max_age_rule() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::with_config(
            dir.path(),
            vec![InvalidationRule::MaxAge(Duration::from_millis(0))],
            PruneStrategy::unbounded(),
        )
        .unwrap();
        cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "", "", &[]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.get(&key(1), &amd64(), "", "").unwrap().is_hit());
    }

    #[test]
    fn test_prune_removes_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "df", "ctx", &[]).unwrap();

        let report = cache.prune(&PruneStrategy { max_files: Some(0), ..PruneStrategy::unbounded() }).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.remaining_entries, 0);
        assert_eq!(report.by_reason.get("count"), Some(&1));
        assert!(dir.path().join("platforms").exists());
        assert_eq!(fs::read_dir(dir.path().join("platforms")).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_triggers_background_prune() {
        let dir = TempDir::new().unwrap();
        let strategy = PruneStrategy { max_files: Some(2), ..PruneStrategy::unbounded() };
        let cache = CacheEngine::with_config(dir.path(), default_rules(), strategy).unwrap();

        for n in 0..5 {
            cache.set(&key(n), &result(OperationType::File, &format!("f{}", n)), &amd64(), "df", "ctx", &[]).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cache.join_background().await;
        // A prune that started mid-way may leave later sets over the limit
        cache.prune_default().unwrap();

        assert!(cache.info().unwrap().entries <= 2);
        assert!(cache.stats().prune_runs >= 1);
    }

    #[test]
    fn test_info_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = CacheEngine::open(dir.path()).unwrap();
        let arm = Platform::new("linux", "arm64", None);
        cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "", "", &[]).unwrap();
        cache.set(&key(2), &result(OperationType::Exec, "b"), &arm, "", "", &[]).unwrap();
        cache.set(&key(3), &result(OperationType::Meta, "c"), &arm, "", "", &[]).unwrap();

        let info = cache.info().unwrap();
        assert_eq!(info.entries, 3);
        assert_eq!(info.shared.entries, 1);
        assert_eq!(info.platforms["linux_amd64"].entries, 1);
        assert_eq!(info.platforms["linux_arm64"].entries, 1);
        assert_eq!(info.total_bytes, info.shared.bytes + info.platforms.values().map(|p| p.bytes).sum::<u64>());

        assert_eq!(cache.clear().unwrap(), 3);
        assert_eq!(cache.info().unwrap().entries, 0);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_stats_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let cache = CacheEngine::open(dir.path()).unwrap();
            cache.set(&key(1), &result(OperationType::Exec, "a"), &amd64(), "", "", &[]).unwrap();
            cache.flush_stats().unwrap();
        }
        let reopened = CacheEngine::open(dir.path()).unwrap();
        assert_eq!(reopened.stats().sets, 1);
    }
}
