//! Centralized path configuration for kiln.
//!
//! All data paths should go through this module so the CLI and embedding
//! programs agree on where the cache and settings live.

use std::path::PathBuf;

/// Get the kiln data directory.
///
/// Resolution order:
/// 1. `KILN_DATA_DIR` environment variable
/// 2. `$XDG_DATA_HOME/kiln` (or the platform equivalent)
/// 3. `~/.kiln`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KILN_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(dir) = dirs::data_dir() {
        return dir.join("kiln");
    }

    dirs::home_dir().map(|h| h.join(".kiln")).unwrap_or_else(|| PathBuf::from("/var/lib/kiln"))
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KILN_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().map(|d| d.join("kiln")).unwrap_or_else(data_dir)
}

/// Get the build cache directory.
pub fn cache_dir() -> PathBuf {
    data_dir().join("cache")
}

/// Get the root under which per-build scratch directories are created.
pub fn work_root() -> PathBuf {
    data_dir().join("work")
}

/// Get the default destination for exported images.
pub fn output_dir() -> PathBuf {
    data_dir().join("images")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_and_work_are_under_data_dir() {
        let data = data_dir();
        assert!(cache_dir().starts_with(&data));
        assert!(work_root().starts_with(&data));
        assert!(output_dir().starts_with(&data));
    }
}
