//! Cache counters, persisted under `metadata/stats.json`.

use super::CacheError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name of the persisted counters.
pub const STATS_FILE: &str = "stats.json";

/// Per-platform counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub bytes_written: u64,
}

/// Cache counters. Lives behind the cache's mutex; readers get a clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub set_failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub malformed: u64,
    pub prune_runs: u64,
    pub platforms: BTreeMap<String, PlatformStats>,
}

impl CacheStats {
    pub fn record_hit(&mut self, platform: &str) {
        self.hits += 1;
        self.platforms.entry(platform.to_string()).or_default().hits += 1;
    }

    pub fn record_miss(&mut self, platform: &str) {
        self.misses += 1;
        self.platforms.entry(platform.to_string()).or_default().misses += 1;
    }

    pub fn record_set(&mut self, platform: &str, bytes: u64) {
        self.sets += 1;
        let stats = self.platforms.entry(platform.to_string()).or_default();
        stats.sets += 1;
        stats.bytes_written += bytes;
    }

    /// Fraction of lookups that hit, 0.0 with no lookups.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    /// Loads counters from `dir`, defaulting when absent or unreadable.
    pub fn load(dir: &Path) -> Self {
        std::fs::read(dir.join(STATS_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, dir: &Path) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        super::entry::write_atomic(&dir.join(STATS_FILE), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut stats = CacheStats::default();
        stats.record_hit("linux/amd64");
        stats.record_miss("linux/amd64");
        stats.record_miss("linux/arm64");
        stats.record_set("linux/arm64", 42);

        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.platforms["linux/arm64"].bytes_written, 42);
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(CacheStats::load(dir.path()), CacheStats::default());

        let mut stats = CacheStats::default();
        stats.record_hit("linux/amd64");
        stats.save(dir.path()).unwrap();
        assert_eq!(CacheStats::load(dir.path()), stats);
    }
}
