//! End-of-build report.

use super::collector::MetricsSnapshot;
use crate::builder::cache::CacheStats;
use crate::error::ErrorKind;
use crate::resources::OperationProfile;
use crate::types::{BuildResult, PlatformResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Summary of one build, logged at the end and returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub success: bool,
    pub duration: Duration,
    pub platforms: BTreeMap<String, PlatformResult>,
    pub operations: usize,
    pub cache_hits: usize,
    pub cache_hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub metrics: MetricsSnapshot,
    /// Usage averages per operation type, from the profiler.
    pub profiles: BTreeMap<String, OperationProfile>,
    pub cache: CacheStats,
    pub peak_concurrent_ops: usize,
}

impl BuildReport {
    pub fn new(
        build_id: &str,
        result: &BuildResult,
        metrics: MetricsSnapshot,
        profiles: BTreeMap<String, OperationProfile>,
        cache: CacheStats,
        peak_concurrent_ops: usize,
    ) -> Self {
        let cache_hit_rate = if result.operations == 0 {
            0.0
        } else {
            result.cache_hits as f64 / result.operations as f64
        };

        Self {
            build_id: build_id.to_string(),
            success: result.success,
            duration: result.duration,
            platforms: result.platform_results.clone(),
            operations: result.operations,
            cache_hits: result.cache_hits,
            cache_hit_rate,
            error: result.error.clone(),
            error_kind: result.error_kind,
            metrics,
            profiles,
            cache,
            peak_concurrent_ops,
        }
    }

    /// Emits the report through `tracing`.
    pub fn log(&self) {
        let report = serde_json::to_string(self).unwrap_or_default();
        if self.success {
            info!(
                build_id = %self.build_id,
                operations = self.operations,
                cache_hits = self.cache_hits,
                duration_ms = self.duration.as_millis() as u64,
                %report,
                "Build report"
            );
        } else {
            warn!(
                build_id = %self.build_id,
                error = self.error.as_deref().unwrap_or_default(),
                kind = self.error_kind.map(|k| k.as_str()).unwrap_or_default(),
                %report,
                "Build report"
            );
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_from_result() {
        let mut result = BuildResult {
            success: false,
            operations: 4,
            cache_hits: 1,
            error: Some("build failed for platforms: linux/arm64".into()),
            error_kind: Some(ErrorKind::Executor),
            ..Default::default()
        };
        result.platform_results.insert("linux/arm64".into(), PlatformResult::default());

        let report = BuildReport::new("b1", &result, MetricsSnapshot::default(), BTreeMap::new(), CacheStats::default(), 2);
        assert_eq!(report.cache_hit_rate, 0.25);

        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty()).unwrap();
        assert_eq!(json["error_kind"], "executor");
        assert_eq!(json["peak_concurrent_ops"], 2);
        assert!(json["platforms"]["linux/arm64"].is_object());
        report.log();
    }
}
