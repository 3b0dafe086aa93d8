//! Build configuration and persistent builder settings.

use crate::error::{KilnError, Result};
use crate::paths;
use crate::types::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-operation timeout.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default per-level (stage) timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default resource sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Artifact produced by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Image,
    Tar,
    Local,
    Oci,
    Multiarch,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "image" => Some(Self::Image),
            "tar" => Some(Self::Tar),
            "local" => Some(Self::Local),
            "oci" => Some(Self::Oci),
            "multiarch" => Some(Self::Multiarch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Tar => "tar",
            Self::Local => "local",
            Self::Oci => "oci",
            Self::Multiarch => "multiarch",
        }
    }
}

/// Which executor implementation runs operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Container,
    Rootless,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Rootless => "rootless",
        }
    }
}

/// Concurrency and memory limits for a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Concurrent per-platform builds.
    pub max_concurrent_builds: usize,
    /// Concurrent operation executions across all builds.
    pub max_concurrent_ops: usize,
    /// Process memory ceiling used by the optimizer and hard-limit checks.
    pub memory_limit_bytes: Option<u64>,
    /// Memory level at which the optimizer compacts monitor histories.
    pub memory_pressure_bytes: Option<u64>,
    /// Fail permit acquisition instead of waiting when over the memory limit.
    pub hard_limit: bool,
    pub sample_interval: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self {
            max_concurrent_builds: (cpus / 2).max(1),
            max_concurrent_ops: cpus.max(2),
            memory_limit_bytes: None,
            memory_pressure_bytes: None,
            hard_limit: false,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_builds == 0 || self.max_concurrent_ops == 0 {
            return Err(KilnError::ResourceExhausted {
                reason: "permit capacities must be at least 1".to_string(),
            });
        }
        if self.sample_interval.is_zero() {
            return Err(KilnError::InvalidConfig {
                reason: "sample interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Registry settings passed through to executors and exporters untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry mirrors keyed by registry host.
    pub mirrors: BTreeMap<String, String>,
    /// Registries reached over plain HTTP.
    pub insecure: Vec<String>,
    /// Directory holding `config.json` credentials (`DOCKER_CONFIG`).
    pub auth_config_dir: Option<PathBuf>,
    /// Reference used for remote cache import/export (`--registry-cache`).
    pub cache_ref: Option<String>,
}

/// A build secret, exposed to executors by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// Caller-supplied description of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build context directory.
    pub context_path: PathBuf,
    /// Dockerfile path, relative to the context unless absolute.
    pub dockerfile_path: PathBuf,
    pub tags: Vec<String>,
    pub output: OutputFormat,
    /// Where the exporter writes; defaults to the build work directory.
    pub output_path: Option<PathBuf>,
    /// Target platforms; empty means the host platform.
    pub platforms: Vec<Platform>,
    pub build_args: BTreeMap<String, String>,
    /// Stage to stop at in a multi-stage build.
    pub target: Option<String>,
    pub push: bool,
    /// Overrides the builder's cache directory for this build.
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub rootless: bool,
    pub resources: Option<ResourceLimits>,
    pub registry: RegistryConfig,
    pub secrets: Vec<Secret>,
    /// Extra ignore patterns, merged with the context's `.dockerignore`.
    pub ignore_patterns: Vec<String>,
    /// Use pipelined dispatch for single-platform builds.
    pub pipelined: bool,
    /// Run per-platform builds concurrently.
    pub parallel_platforms: bool,
    /// Overall build deadline.
    pub timeout: Option<Duration>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context_path: PathBuf::from("."),
            dockerfile_path: PathBuf::from("Dockerfile"),
            tags: Vec::new(),
            output: OutputFormat::default(),
            output_path: None,
            platforms: Vec::new(),
            build_args: BTreeMap::new(),
            target: None,
            push: false,
            cache_dir: None,
            no_cache: false,
            rootless: false,
            resources: None,
            registry: RegistryConfig::default(),
            secrets: Vec::new(),
            ignore_patterns: Vec::new(),
            pipelined: false,
            parallel_platforms: true,
            timeout: None,
        }
    }
}

impl BuildConfig {
    /// Dockerfile location resolved against the context.
    pub fn resolved_dockerfile(&self) -> PathBuf {
        if self.dockerfile_path.is_absolute() {
            self.dockerfile_path.clone()
        } else {
            self.context_path.join(&self.dockerfile_path)
        }
    }

    /// Requested platforms, or the host platform when none were given.
    pub fn effective_platforms(&self) -> Vec<Platform> {
        if self.platforms.is_empty() {
            return vec![Platform::host()];
        }
        let mut seen = Vec::with_capacity(self.platforms.len());
        for p in &self.platforms {
            if !seen.contains(p) {
                seen.push(p.clone());
            }
        }
        seen
    }
}

/// Persistent configuration for a kiln builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub log_json: bool,
    pub cache_dir: PathBuf,
    pub work_root: PathBuf,
    /// Container runtime used by the container executor (`docker` or `podman`).
    pub runtime: String,
    pub executor: ExecutorKind,
    pub resources: ResourceLimits,
    pub cache_max_size_bytes: Option<u64>,
    pub cache_max_age_secs: Option<u64>,
    pub cache_max_files: Option<usize>,
    pub cache_platform_quota_bytes: Option<u64>,
    pub op_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    pub docker_config: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            cache_dir: paths::cache_dir(),
            work_root: paths::work_root(),
            runtime: "docker".to_string(),
            executor: ExecutorKind::default(),
            resources: ResourceLimits::default(),
            cache_max_size_bytes: Some(10 * 1024 * 1024 * 1024), // 10 GB
            cache_max_age_secs: Some(7 * 24 * 60 * 60),
            cache_max_files: None,
            cache_platform_quota_bytes: None,
            op_timeout_secs: DEFAULT_OP_TIMEOUT.as_secs(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT.as_secs(),
            docker_config: None,
        }
    }
}

impl Settings {
    /// Get the path to the settings file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load settings from disk and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let settings = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| KilnError::InvalidConfig {
                reason: format!("Failed to read config: {}", e),
            })?;
            serde_json::from_str(&content).map_err(|e| KilnError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };
        settings.with_env_overrides()
    }

    /// Save settings to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KilnError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| KilnError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| KilnError::Io { path, source: e })
    }

    /// Apply `LOG_LEVEL`, `RUNTIME` and `DOCKER_CONFIG`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(runtime) = std::env::var("RUNTIME") {
            match runtime.as_str() {
                "docker" | "podman" => self.runtime = runtime,
                other => {
                    return Err(KilnError::InvalidConfig {
                        reason: format!("RUNTIME must be docker or podman, got {}", other),
                    })
                }
            }
        }
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            self.docker_config = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_valid() {
        let limits = ResourceLimits::default();
        assert!(limits.max_concurrent_builds >= 1);
        assert!(limits.max_concurrent_ops >= 2);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let limits = ResourceLimits { max_concurrent_ops: 0, ..Default::default() };
        let err = limits.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn test_effective_platforms() {
        let config = BuildConfig::default();
        assert_eq!(config.effective_platforms(), vec![Platform::host()]);

        let amd: Platform = "linux/amd64".parse().unwrap();
        let config = BuildConfig {
            platforms: vec![amd.clone(), amd.clone()],
            ..Default::default()
        };
        assert_eq!(config.effective_platforms(), vec![amd]);
    }

    #[test]
    fn test_resolved_dockerfile() {
        let config = BuildConfig {
            context_path: PathBuf::from("/ctx"),
            dockerfile_path: PathBuf::from("build/Dockerfile"),
            ..Default::default()
        };
        assert_eq!(config.resolved_dockerfile(), PathBuf::from("/ctx/build/Dockerfile"));
    }

    #[test]
    fn test_settings_roundtrip_with_defaults() {
        let json = r#"{"log_level": "debug", "op_timeout_secs": 60}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.op_timeout(), Duration::from_secs(60));
        assert_eq!(settings.stage_timeout(), DEFAULT_STAGE_TIMEOUT);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("OCI"), Some(OutputFormat::Oci));
        assert_eq!(OutputFormat::parse("zip"), None);
    }
}
