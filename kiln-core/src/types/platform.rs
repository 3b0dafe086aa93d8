//! Build target platforms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A build target, e.g. `linux/amd64` or `linux/arm/v7`.
///
/// Equality is on the normalized form: architecture aliases such as `x86_64`
/// and `aarch64` are folded to their OCI names when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            os: os.to_ascii_lowercase(),
            architecture: normalize_arch(architecture).to_string(),
            variant: variant.filter(|v| !v.is_empty()).map(|v| v.to_ascii_lowercase()),
        }
    }

    /// The platform this process runs on.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            // Images are always Linux images, even when built from macOS.
            "macos" => "linux",
            other => other,
        };
        Self::new(os, std::env::consts::ARCH, None)
    }

    /// Parses a comma-separated platform list (`linux/amd64,linux/arm64`).
    pub fn parse_list(s: &str) -> Result<Vec<Self>, PlatformParseError> {
        s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::parse).collect()
    }

    /// Directory name used by the cache layout: `os_arch[_variant]`.
    pub fn cache_dir_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}_{}_{}", self.os, self.architecture, variant),
            None => format!("{}_{}", self.os, self.architecture),
        }
    }
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        "i386" | "i686" => "386",
        other => other,
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Error returned for malformed platform strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid platform '{input}': expected os/arch[/variant]")]
pub struct PlatformParseError {
    pub input: String,
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let err = || PlatformParseError { input: s.to_string() };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(err());
        }
        match parts.as_slice() {
            [os, arch] => Ok(Self::new(os, arch, None)),
            [os, arch, variant] => Ok(Self::new(os, arch, Some(variant))),
            _ => Err(err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let p: Platform = "linux/arm/v7".parse().unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.architecture, "arm");
        assert_eq!(p.variant.as_deref(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
        assert_eq!(p.cache_dir_name(), "linux_arm_v7");
    }

    #[test]
    fn test_arch_normalization() {
        let a: Platform = "linux/x86_64".parse().unwrap();
        let b: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cache_dir_name(), "linux_amd64");
    }

    #[test]
    fn test_parse_list() {
        let list = Platform::parse_list("linux/amd64, linux/arm64").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "linux/arm64");
    }

    #[test]
    fn test_invalid_platform() {
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//v7".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }
}
