//! Content hashing for cache validation.
//!
//! The build-context hash is computed by a deterministic walk: directory
//! entries are visited pre-order, siblings sorted byte-wise by file name, so
//! a directory is absorbed before its contents. For every non-ignored path the
//! hasher absorbs the `/`-separated relative path, size (0 for directories),
//! mtime in whole epoch seconds, the unix mode bits, and the full content of
//! regular files (the link target for symlinks).

use super::CacheError;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the ignore file read from the context root.
pub const DOCKERIGNORE: &str = ".dockerignore";

/// Lower-case hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of the raw Dockerfile bytes.
pub fn compute_dockerfile_hash(path: &Path) -> Result<String, CacheError> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// One ignore rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnorePattern {
    /// Exact relative path; also prunes everything beneath it
    Literal(String),
    /// `*.ext` style suffix glob
    Suffix(String),
    /// Matches when the relative path contains the pattern
    Substring(String),
}

impl IgnorePattern {
    /// Parses a user pattern (`.dockerignore` line or `--ignore` value).
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().trim_start_matches("./").trim_end_matches('/');
        if pattern.is_empty() {
            return None;
        }
        match pattern.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') && !suffix.contains('*') => {
                Some(IgnorePattern::Suffix(suffix.to_string()))
            }
            _ => Some(IgnorePattern::Substring(pattern.to_string())),
        }
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        match self {
            IgnorePattern::Literal(p) => {
                rel_path == p
                    || rel_path.strip_prefix(p.as_str()).map(|r| r.starts_with('/')).unwrap_or(false)
            }
            IgnorePattern::Suffix(s) => rel_path.ends_with(s.as_str()),
            IgnorePattern::Substring(p) => rel_path == p || rel_path.contains(p.as_str()),
        }
    }
}

/// Set of ignore rules applied while hashing a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnorePatterns {
    patterns: Vec<IgnorePattern>,
}

impl IgnorePatterns {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.extend(patterns);
        set
    }

    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.patterns.extend(patterns.into_iter().filter_map(|p| IgnorePattern::parse(p.as_ref())));
    }

    /// Ignores one exact relative path and its subtree.
    pub fn exclude_path(&mut self, rel_path: &str) {
        let rel_path = rel_path.trim_matches('/');
        if !rel_path.is_empty() {
            self.patterns.push(IgnorePattern::Literal(rel_path.to_string()));
        }
    }

    /// Adds the rules from `<root>/.dockerignore`, if present.
    ///
    /// Comment lines and negations (`!pattern`) are skipped.
    pub fn load_dockerignore(&mut self, root: &Path) -> Result<(), CacheError> {
        let path = root.join(DOCKERIGNORE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                debug!(pattern = line, "Skipping unsupported negated ignore pattern");
                continue;
            }
            self.extend([line]);
        }
        Ok(())
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(rel_path))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Hashes the build context rooted at `root`.
pub fn compute_context_hash(root: &Path, ignore: &IgnorePatterns) -> Result<String, CacheError> {
    let mut hasher = Sha256::new();
    let mut absorbed = 0usize;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            relative_path(root, entry.path()).map(|rel| !ignore.is_ignored(&rel)).unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            CacheError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk loop")))
        })?;
        let Some(rel) = relative_path(root, entry.path()) else { continue };
        let metadata = entry.metadata().map_err(|e| {
            CacheError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk loop")))
        })?;

        let file_type = entry.file_type();
        let size = if file_type.is_dir() { 0 } else { metadata.len() };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(mode_bits(&metadata).to_le_bytes());

        if file_type.is_file() {
            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        }
        absorbed += 1;
    }

    let hash = format!("{:x}", hasher.finalize());
    debug!(root = %root.display(), entries = absorbed, hash = %hash, "Computed context hash");
    Ok(hash)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> =
        rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("src/nested/lib.rs"), "pub fn f() {}\n").unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        dir
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_dockerfile_hash_is_raw_bytes() {
        let dir = context();
        let hash = compute_dockerfile_hash(&dir.path().join("Dockerfile")).unwrap();
        assert_eq!(hash, sha256_hex(b"FROM alpine\n"));
    }

    #[test]
    fn test_context_hash_stable() {
        let dir = context();
        let ignore = IgnorePatterns::default();
        let first = compute_context_hash(dir.path(), &ignore).unwrap();
        let second = compute_context_hash(dir.path(), &ignore).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_context_hash_sees_content_change() {
        let dir = context();
        let ignore = IgnorePatterns::default();
        let before = compute_context_hash(dir.path(), &ignore).unwrap();

        // Same length, so only content differs
        fs::write(dir.path().join("src/main.rs"), "fn mian() {}\n").unwrap();
        let after = compute_context_hash(dir.path(), &ignore).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_ignored_paths_do_not_affect_hash() {
        let dir = context();
        let ignore = IgnorePatterns::new(["*.log", "nested"]);
        let before = compute_context_hash(dir.path(), &ignore).unwrap();

        fs::write(dir.path().join("debug.log"), "more noise").unwrap();
        fs::write(dir.path().join("src/nested/lib.rs"), "changed").unwrap();
        fs::write(dir.path().join("src/nested/new.rs"), "added").unwrap();
        let after = compute_context_hash(dir.path(), &ignore).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_pattern_kinds() {
        assert_eq!(IgnorePattern::parse("*.log"), Some(IgnorePattern::Suffix(".log".into())));
        assert_eq!(IgnorePattern::parse("./target/"), Some(IgnorePattern::Substring("target".into())));
        assert_eq!(IgnorePattern::parse("  "), None);

        let literal = IgnorePattern::Literal(".kiln-cache".into());
        assert!(literal.matches(".kiln-cache"));
        assert!(literal.matches(".kiln-cache/platforms/x"));
        assert!(!literal.matches("src/.kiln-cache-notes"));

        let substring = IgnorePattern::Substring("node_modules".into());
        assert!(substring.matches("web/node_modules/react"));
    }

    #[test]
    fn test_dockerignore_loading() {
        let dir = context();
        fs::write(dir.path().join(DOCKERIGNORE), "# comment\n*.log\n\n!keep.log\nsrc/nested\n").unwrap();

        let mut ignore = IgnorePatterns::default();
        ignore.load_dockerignore(dir.path()).unwrap();
        assert_eq!(ignore.len(), 2);
        assert!(ignore.is_ignored("debug.log"));
        assert!(ignore.is_ignored("src/nested/lib.rs"));
        assert!(!ignore.is_ignored("src/main.rs"));
    }

    #[test]
    fn test_missing_dockerignore_is_fine() {
        let dir = TempDir::new().unwrap();
        let mut ignore = IgnorePatterns::default();
        ignore.load_dockerignore(dir.path()).unwrap();
        assert!(ignore.is_empty());
    }
}
