//! Pruning strategy and victim selection.
//!
//! Selection is a pure function over a snapshot of entry descriptors; the
//! cache engine takes the snapshot under its lock and deletes outside it.

use super::entry::StorageClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Limits a pruning run restores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneStrategy {
    /// Total bytes across all entries
    pub max_size: Option<u64>,
    /// Maximum entry age, measured from creation
    pub max_age: Option<Duration>,
    /// Total number of entries
    pub max_files: Option<usize>,
    /// Bytes per platform partition (shared entries are exempt)
    pub platform_quota: Option<u64>,
    /// Evict least recently accessed first; otherwise oldest created first
    pub lru_enabled: bool,
    /// Remove entries whose dependencies no remaining entry produces
    pub orphan_cleanup: bool,
}

impl Default for PruneStrategy {
    fn default() -> Self {
        Self {
            max_size: Some(10 * 1024 * 1024 * 1024), // 10GB
            max_age: Some(super::rules::DEFAULT_MAX_AGE),
            max_files: None,
            platform_quota: None,
            lru_enabled: true,
            orphan_cleanup: true,
        }
    }
}

impl PruneStrategy {
    /// A strategy that removes nothing.
    pub fn unbounded() -> Self {
        Self {
            max_size: None,
            max_age: None,
            max_files: None,
            platform_quota: None,
            lru_enabled: true,
            orphan_cleanup: false,
        }
    }

    /// Whether approximate totals already break a size or count limit.
    pub fn exceeded_by(&self, total_bytes: u64, total_files: usize) -> bool {
        self.max_size.map(|max| total_bytes > max).unwrap_or(false)
            || self.max_files.map(|max| total_files > max).unwrap_or(false)
    }
}

/// Why an entry was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    Malformed,
    Age,
    Size,
    Count,
    PlatformQuota,
    Orphan,
}

impl PruneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PruneReason::Malformed => "malformed",
            PruneReason::Age => "age",
            PruneReason::Size => "size",
            PruneReason::Count => "count",
            PruneReason::PlatformQuota => "platform_quota",
            PruneReason::Orphan => "orphan",
        }
    }
}

/// Snapshot of one stored entry.
#[derive(Debug, Clone)]
pub struct PruneCandidate {
    pub path: PathBuf,
    pub key: String,
    pub class: StorageClass,
    /// Bytes on disk
    pub size: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub outputs: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Outcome of a pruning run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
    pub by_reason: BTreeMap<String, usize>,
    pub failed_deletions: usize,
}

/// Selects the entries to remove so that every limit of `strategy` holds.
///
/// Stages run in order: age, total size, file count, platform quota, orphans.
/// Within a stage, victims are taken in LRU order when enabled, else in
/// creation order. Returns `(index, reason)` pairs into `candidates`.
pub fn select(
    candidates: &[PruneCandidate],
    strategy: &PruneStrategy,
    now_ms: u64,
) -> Vec<(usize, PruneReason)> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    if strategy.lru_enabled {
        order.sort_by(|&a, &b| {
            let (a, b) = (&candidates[a], &candidates[b]);
            (a.last_accessed, a.created_at, &a.key).cmp(&(b.last_accessed, b.created_at, &b.key))
        });
    } else {
        order.sort_by(|&a, &b| {
            let (a, b) = (&candidates[a], &candidates[b]);
            (a.created_at, &a.key).cmp(&(b.created_at, &b.key))
        });
    }

    let mut removed: BTreeSet<usize> = BTreeSet::new();
    let mut selected = Vec::new();
    let mut take = |idx: usize, reason: PruneReason, removed: &mut BTreeSet<usize>| {
        if removed.insert(idx) {
            selected.push((idx, reason));
        }
    };

    // (1) age
    if let Some(max_age) = strategy.max_age {
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as u64);
        for &idx in &order {
            if candidates[idx].created_at < cutoff {
                take(idx, PruneReason::Age, &mut removed);
            }
        }
    }

    // (2) total size
    if let Some(max_size) = strategy.max_size {
        let mut total: u64 = remaining(candidates, &removed).map(|c| c.size).sum();
        for &idx in &order {
            if total <= max_size {
                break;
            }
            if !removed.contains(&idx) {
                total -= candidates[idx].size;
                take(idx, PruneReason::Size, &mut removed);
            }
        }
    }

    // (3) file count
    if let Some(max_files) = strategy.max_files {
        let mut count = candidates.len() - removed.len();
        for &idx in &order {
            if count <= max_files {
                break;
            }
            if !removed.contains(&idx) {
                count -= 1;
                take(idx, PruneReason::Count, &mut removed);
            }
        }
    }

    // (4) platform quota. A single global order is walked while any platform
    // is over quota, so entries of other platforms can be evicted too.
    if let Some(quota) = strategy.platform_quota {
        let mut usage: BTreeMap<&str, u64> = BTreeMap::new();
        for c in remaining(candidates, &removed) {
            if let Some(dir) = c.class.platform_dir() {
                *usage.entry(dir).or_default() += c.size;
            }
        }

        for &idx in &order {
            if usage.values().all(|&bytes| bytes <= quota) {
                break;
            }
            let Some(dir) = candidates[idx].class.platform_dir() else { continue };
            if removed.contains(&idx) {
                continue;
            }
            if let Some(bytes) = usage.get_mut(dir) {
                *bytes -= candidates[idx].size;
            }
            take(idx, PruneReason::PlatformQuota, &mut removed);
        }
    }

    // (5) orphans, to a fixpoint
    if strategy.orphan_cleanup {
        loop {
            let produced: BTreeSet<&str> = remaining(candidates, &removed)
                .flat_map(|c| c.outputs.iter().map(String::as_str))
                .collect();
            let orphans: Vec<usize> = order
                .iter()
                .copied()
                .filter(|idx| !removed.contains(idx))
                .filter(|&idx| {
                    candidates[idx]
                        .dependencies
                        .iter()
                        .any(|dep| !is_external(dep) && !produced.contains(dep.as_str()))
                })
                .collect();
            if orphans.is_empty() {
                break;
            }
            for idx in orphans {
                take(idx, PruneReason::Orphan, &mut removed);
            }
        }
    }

    selected
}

fn remaining<'a, 'b: 'a>(
    candidates: &'b [PruneCandidate],
    removed: &'a BTreeSet<usize>,
) -> impl Iterator<Item = &'b PruneCandidate> + 'a {
    candidates.iter().enumerate().filter(|(i, _)| !removed.contains(i)).map(|(_, c)| c)
}

/// Inputs such as `context://` or `image://` come from outside the cache.
fn is_external(dependency: &str) -> bool {
    dependency.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    fn candidate(key: &str, class: StorageClass, size: u64, created: u64, accessed: u64) -> PruneCandidate {
        PruneCandidate {
            path: PathBuf::from(key),
            key: key.to_string(),
            class,
            size,
            created_at: created,
            last_accessed: accessed,
            outputs: vec![format!("out-{}", key)],
            dependencies: vec![],
        }
    }

    fn keys(candidates: &[PruneCandidate], selected: &[(usize, PruneReason)]) -> BTreeSet<String> {
        selected.iter().map(|(i, _)| candidates[*i].key.clone()).collect()
    }

    #[test]
    fn test_size_lru_keeps_most_recent() {
        // Creation order is the reverse of access order
        let candidates: Vec<_> = (0..10)
            .map(|i| candidate(&format!("k{}", i), StorageClass::Shared, MB, 100 - i, 1_000 + i))
            .collect();
        let strategy = PruneStrategy { max_size: Some(4 * MB), ..PruneStrategy::unbounded() };

        let selected = select(&candidates, &strategy, 2_000);
        assert_eq!(selected.len(), 6);
        assert!(selected.iter().all(|(_, r)| *r == PruneReason::Size));
        let expected: BTreeSet<String> = (0..6).map(|i| format!("k{}", i)).collect();
        assert_eq!(keys(&candidates, &selected), expected);
    }

    #[test]
    fn test_size_creation_order() {
        let candidates: Vec<_> = (0..10)
            .map(|i| candidate(&format!("k{}", i), StorageClass::Shared, MB, 100 - i, 1_000 + i))
            .collect();
        let strategy = PruneStrategy {
            max_size: Some(4 * MB),
            lru_enabled: false,
            ..PruneStrategy::unbounded()
        };

        let selected = select(&candidates, &strategy, 2_000);
        let expected: BTreeSet<String> = (4..10).map(|i| format!("k{}", i)).collect();
        assert_eq!(keys(&candidates, &selected), expected);
    }

    #[test]
    fn test_age_then_count() {
        let candidates = vec![
            candidate("old", StorageClass::Shared, 1, 0, 0),
            candidate("a", StorageClass::Shared, 1, 9_000, 9_000),
            candidate("b", StorageClass::Shared, 1, 9_100, 9_100),
            candidate("c", StorageClass::Shared, 1, 9_200, 9_200),
        ];
        let strategy = PruneStrategy {
            max_age: Some(Duration::from_secs(5)),
            max_files: Some(2),
            ..PruneStrategy::unbounded()
        };

        let selected = select(&candidates, &strategy, 10_000);
        assert_eq!(selected[0], (0, PruneReason::Age));
        assert_eq!(selected[1], (1, PruneReason::Count));
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_platform_quota_uses_global_order() {
        let amd = StorageClass::Platform("linux_amd64".into());
        let arm = StorageClass::Platform("linux_arm64".into());
        let candidates = vec![
            candidate("arm-old", arm.clone(), 2 * MB, 1, 1),
            candidate("amd-1", amd.clone(), 3 * MB, 2, 2),
            candidate("amd-2", amd.clone(), 3 * MB, 3, 3),
            candidate("shared", StorageClass::Shared, 10 * MB, 0, 0),
        ];
        let strategy = PruneStrategy { platform_quota: Some(4 * MB), ..PruneStrategy::unbounded() };

        let selected = select(&candidates, &strategy, 10);
        // amd64 is over quota; the older arm64 entry goes first
        assert_eq!(keys(&candidates, &selected), BTreeSet::from(["arm-old".to_string(), "amd-1".to_string()]));
        assert!(selected.iter().all(|(_, r)| *r == PruneReason::PlatformQuota));
    }

    #[test]
    fn test_quota_counts_only_survivors_of_size_stage() {
        let amd = StorageClass::Platform("linux_amd64".into());
        let candidates = vec![
            candidate("amd-1", amd.clone(), 3 * MB, 1, 1),
            candidate("amd-2", amd.clone(), 3 * MB, 2, 2),
            candidate("amd-3", amd.clone(), 3 * MB, 3, 3),
        ];
        let strategy = PruneStrategy {
            max_size: Some(6 * MB),
            platform_quota: Some(3 * MB),
            ..PruneStrategy::unbounded()
        };

        let selected = select(&candidates, &strategy, 10);
        assert_eq!(selected, vec![(0, PruneReason::Size), (1, PruneReason::PlatformQuota)]);
    }

    #[test]
    fn test_orphans_cascade() {
        let mut base = candidate("base", StorageClass::Shared, 1, 1, 1);
        base.dependencies = vec!["image://alpine:latest".into()];
        let mut mid = candidate("mid", StorageClass::Shared, 1, 2, 2);
        mid.dependencies = vec!["out-gone".into()];
        let mut leaf = candidate("leaf", StorageClass::Shared, 1, 3, 3);
        leaf.dependencies = vec!["out-mid".into()];
        let mut ok = candidate("ok", StorageClass::Shared, 1, 4, 4);
        ok.dependencies = vec!["out-base".into()];
        let candidates = vec![base, mid, leaf, ok];

        let strategy = PruneStrategy { orphan_cleanup: true, ..PruneStrategy::unbounded() };
        let selected = select(&candidates, &strategy, 10);
        assert_eq!(keys(&candidates, &selected), BTreeSet::from(["mid".to_string(), "leaf".to_string()]));
    }

    #[test]
    fn test_unbounded_selects_nothing() {
        let candidates = vec![candidate("a", StorageClass::Shared, MB, 0, 0)];
        assert!(select(&candidates, &PruneStrategy::unbounded(), u64::MAX).is_empty());
    }

    #[test]
    fn test_exceeded_by() {
        let strategy = PruneStrategy { max_size: Some(10), max_files: Some(2), ..PruneStrategy::unbounded() };
        assert!(!strategy.exceeded_by(10, 2));
        assert!(strategy.exceeded_by(11, 0));
        assert!(strategy.exceeded_by(0, 3));
    }
}
