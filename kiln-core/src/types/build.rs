//! Aggregate build results.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of one per-platform build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub success: bool,
    /// Image ID (`sha256:<hex>`) derived from the executed operation keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub operations: usize,
    pub cache_hits: usize,
    pub duration: Duration,
}

/// Result of a `build()` across all requested platforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    /// Keyed by normalized platform string (`linux/arm64`).
    pub platform_results: BTreeMap<String, PlatformResult>,
    pub multi_arch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_list_id: Option<String>,
    /// Total operations executed or replayed, summed over platforms.
    pub operations: usize,
    pub cache_hits: usize,
    pub duration: Duration,
    /// Deterministic build facts (hashes, platforms, tags); stable across warm runs.
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Most severe error category encountered, if the build failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl BuildResult {
    /// A failed result for errors raised before any platform ran.
    pub fn failed(error: &crate::error::KilnError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Default::default()
        }
    }

    /// Platforms whose build failed, in platform order.
    pub fn failed_platforms(&self) -> Vec<&str> {
        self.platform_results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(p, _)| p.as_str())
            .collect()
    }

    /// Exit code for the CLI: 0 on success, else the code of `error_kind`.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            return 0;
        }
        self.error_kind.map(|k| k.exit_code()).unwrap_or(1)
    }
}
