//! Persisted cache records and their on-disk layout.

use super::CacheError;
use crate::types::{OperationResult, Platform};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory holding platform-specific entries.
pub const PLATFORMS_DIR: &str = "platforms";
/// Directory holding platform-agnostic entries.
pub const SHARED_DIR: &str = "shared";
/// Directory holding counters and statistics.
pub const METADATA_DIR: &str = "metadata";

/// One cached operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key (SHA256 hash of the operation)
    pub key: String,
    pub result: OperationResult,
    /// Creation time, milliseconds since the epoch
    pub created_at: u64,
    /// Last read, milliseconds since the epoch (for LRU)
    pub last_accessed: u64,
    pub access_count: u64,
    pub platform: Platform,
    pub dockerfile_hash: String,
    pub context_hash: String,
    /// Output names this entry's operation consumed
    pub dependencies: Vec<String>,
    /// Serialized size of the result in bytes
    pub size: u64,
}

impl CacheEntry {
    pub fn storage_class(&self) -> StorageClass {
        StorageClass::of(&self.result.operation.op_type, &self.platform)
    }

    /// Outputs produced by the cached operation.
    pub fn outputs(&self) -> &[String] {
        &self.result.operation.outputs
    }
}

/// Partition an entry is stored in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageClass {
    /// Under `platforms/<dir>/`
    Platform(String),
    /// Under `shared/`
    Shared,
}

impl StorageClass {
    pub fn of(op_type: &crate::types::OperationType, platform: &Platform) -> Self {
        if op_type.is_platform_specific() {
            StorageClass::Platform(platform.cache_dir_name())
        } else {
            StorageClass::Shared
        }
    }

    pub fn platform_dir(&self) -> Option<&str> {
        match self {
            StorageClass::Platform(dir) => Some(dir),
            StorageClass::Shared => None,
        }
    }
}

/// Validates that a key is hex and long enough to shard.
pub fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.len() < 4 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Path of the entry file for `key` in `class` under `base`.
///
/// Determined solely by the key and the storage class.
pub fn entry_path(base: &Path, key: &str, class: &StorageClass) -> PathBuf {
    let root = match class {
        StorageClass::Platform(dir) => base.join(PLATFORMS_DIR).join(dir),
        StorageClass::Shared => base.join(SHARED_DIR),
    };
    root.join(&key[0..2]).join(&key[2..4]).join(key)
}

/// Temporary files are dot-prefixed and never parsed as entries.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with('.')).unwrap_or(false)
}

pub fn read_entry(path: &Path) -> Result<CacheEntry, CacheError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Serializes `entry` to `path` atomically; returns the bytes written.
pub fn write_entry(path: &Path, entry: &CacheEntry) -> Result<u64, CacheError> {
    let bytes = serde_json::to_vec(entry)?;
    write_atomic(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Writes to a sibling temp file and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::CacheDirectoryError(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("entry");
    let tmp = parent.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()));

    let result = (|| -> Result<(), CacheError> {
        let mut file = match fs::File::create(&tmp) {
            Ok(file) => file,
            // An empty-directory sweep may have removed the shard in between
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(parent)?;
                fs::File::create(&tmp)?
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Current time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
