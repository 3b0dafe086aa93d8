//! Operation executors.
//!
//! The scheduler hands every cache-missed operation to an [`Executor`]
//! together with a scratch work directory owned by the build. Executors may
//! block, must honour cancellation, and must not write outside that
//! directory.
//!
//! Only [`LocalExecutor`] ships in-tree. It materializes file operations
//! from the build context, records every step in a journal, and optionally
//! runs `RUN` commands on the host. Container and rootless executors are
//! provided externally and plugged in through the same trait.

use crate::builder::cache::hash::sha256_hex;
use crate::builder::frontend::CONTEXT_INPUT_PREFIX;
use crate::config::ExecutorKind;
use crate::error::{KilnError, Result};
use crate::types::{Operation, OperationResult, OperationType};
use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Journal file written inside the work directory.
pub const JOURNAL_FILE: &str = "journal.log";

/// Directory under the work directory that receives file operations.
pub const ROOTFS_DIR: &str = "rootfs";

/// Executes one operation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name used in logs ("local", "container", ...).
    fn name(&self) -> &'static str;

    /// Runs `operation` with `work_dir` as its only writable location.
    ///
    /// Returns `Ok` with an unsuccessful result for ordinary step failures
    /// and `Err` for cancellation or executor breakage.
    async fn execute(
        &self,
        operation: &Operation,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<OperationResult>;
}

/// Creates the executor for `kind`.
pub fn create_executor(kind: ExecutorKind, context_path: &Path) -> Result<Arc<dyn Executor>> {
    match kind {
        ExecutorKind::Local => Ok(Arc::new(LocalExecutor::new(context_path))),
        other => Err(KilnError::ExecutorUnavailable {
            executor: other.as_str().to_string(),
            reason: "not built into this binary; supply an implementation of Executor".to_string(),
        }),
    }
}

/// Reference executor working directly on the host filesystem.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    context_path: PathBuf,
    host_exec: bool,
}

impl LocalExecutor {
    pub fn new(context_path: impl Into<PathBuf>) -> Self {
        Self { context_path: context_path.into(), host_exec: false }
    }

    /// Run `RUN` commands on the host instead of only journaling them.
    pub fn with_host_exec(mut self, enabled: bool) -> Self {
        self.host_exec = enabled;
        self
    }

    fn stage_root(work_dir: &Path, operation: &Operation) -> PathBuf {
        let stage = operation.metadata.get("stage").map(String::as_str).unwrap_or("0");
        work_dir.join(ROOTFS_DIR).join(sanitize(stage))
    }

    fn copy_from_context(&self, operation: &Operation, work_dir: &Path) -> Result<usize> {
        let Some(destination) = operation.command.last() else {
            return Ok(0);
        };
        let root = Self::stage_root(work_dir, operation);
        let target = contained(&root, &resolve_in_image(&operation.work_dir, destination));
        let into_dir = destination.ends_with('/');

        let mut copied = 0;
        for input in &operation.inputs {
            let Some(source) = input.strip_prefix(CONTEXT_INPUT_PREFIX) else { continue };
            let source_path = contained(&self.context_path, source);
            if !source_path.exists() {
                return Err(KilnError::ExecutionFailed {
                    operation: operation.describe(),
                    reason: format!("{} not found in build context", source),
                });
            }
            copied += copy_tree(&source_path, &target, into_dir).map_err(|e| KilnError::Io {
                path: source_path.clone(),
                source: e,
            })?;
        }
        Ok(copied)
    }

    async fn run_on_host(
        &self,
        operation: &Operation,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), String>> {
        let argv = &operation.command[1..];
        let Some((program, args)) = argv.split_first() else {
            return Ok(Err("empty command".to_string()));
        };

        let root = Self::stage_root(work_dir, operation);
        fs::create_dir_all(&root).map_err(|e| KilnError::Io { path: root.clone(), source: e })?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&root)
            .env_clear()
            .envs(&operation.env)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KilnError::ExecutionFailed {
                operation: operation.describe(),
                reason: format!("failed to spawn {}: {}", program, e),
            })?;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(KilnError::cancelled(format!("{} interrupted", operation.describe())));
            }
            status = child.wait() => status.map_err(|e| KilnError::ExecutionFailed {
                operation: operation.describe(),
                reason: e.to_string(),
            })?,
        };

        if status.success() {
            Ok(Ok(()))
        } else {
            Ok(Err(format!("command exited with {}", status)))
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, operation, work_dir, cancel), fields(op = %operation.describe()))]
    async fn execute(
        &self,
        operation: &Operation,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        if cancel.is_cancelled() {
            return Err(KilnError::cancelled(format!("{} not started", operation.describe())));
        }
        journal(work_dir, operation)?;

        match operation.op_type {
            OperationType::File if operation.metadata.get("remote").is_some_and(|v| v == "true") => {
                // Remote sources are fetched by registry-aware executors
                debug!("Recorded remote ADD without fetching");
            }
            OperationType::File if !operation.metadata.contains_key("from") => {
                let count = self.copy_from_context(operation, work_dir)?;
                debug!(files = count, "Copied context files");
            }
            OperationType::Exec if self.host_exec => {
                if let Err(reason) = self.run_on_host(operation, work_dir, cancel).await? {
                    warn!(%reason, "Command failed");
                    return Ok(OperationResult::failed(operation, reason));
                }
            }
            _ => {}
        }

        let outputs = operation.outputs.iter().map(|name| artifact_id(operation, name)).collect();
        let mut result = OperationResult::succeeded(operation, outputs);
        if operation.op_type == OperationType::Meta {
            result = result.with_env(operation.env.clone());
        }
        info!("Executed operation");
        Ok(result)
    }
}

/// Content identifier of an output produced by `operation`.
pub fn artifact_id(operation: &Operation, output: &str) -> String {
    format!("sha256:{}", sha256_hex(format!("{}\0{}", operation.cache_key(), output).as_bytes()))
}

fn journal(work_dir: &Path, operation: &Operation) -> Result<()> {
    let path = work_dir.join(JOURNAL_FILE);
    let line = format!("{} {} {}\n", operation.platform, operation.op_type, operation.command.join(" "));
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(line.as_bytes()))
        .map_err(|e| KilnError::Io { path, source: e })
}

fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

fn resolve_in_image(work_dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", work_dir.trim_end_matches('/'), path)
    }
}

/// Joins `path` onto `root`, dropping any component that would escape it.
fn contained(root: &Path, path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

fn copy_tree(source: &Path, target: &Path, into_dir: bool) -> std::io::Result<usize> {
    if source.is_file() {
        let dest = match (into_dir, source.file_name()) {
            (true, Some(name)) => target.join(name),
            _ => target.to_path_buf(),
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &dest)?;
        return Ok(1);
    }

    let mut copied = 0;
    for entry in walkdir::WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(source).map_err(std::io::Error::other)?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::frontend;
    use crate::config::BuildConfig;
    use tempfile::TempDir;

    fn lower(text: &str) -> Vec<Operation> {
        let config = BuildConfig { platforms: vec!["linux/amd64".parse().unwrap()], ..Default::default() };
        frontend::parse(text, &config).unwrap()
    }

    #[tokio::test]
    async fn test_copy_from_context() {
        let context = TempDir::new().unwrap();
        fs::write(context.path().join("app.conf"), "port=80").unwrap();
        fs::create_dir_all(context.path().join("static/css")).unwrap();
        fs::write(context.path().join("static/css/site.css"), "body{}").unwrap();
        let work = TempDir::new().unwrap();

        let ops = lower("FROM alpine\nWORKDIR /srv\nCOPY app.conf conf/\nCOPY static /www");
        let executor = LocalExecutor::new(context.path());
        let cancel = CancellationToken::new();
        for op in &ops {
            let result = executor.execute(op, work.path(), &cancel).await.unwrap();
            assert!(result.success);
        }

        let root = work.path().join(ROOTFS_DIR).join("0");
        assert_eq!(fs::read_to_string(root.join("srv/conf/app.conf")).unwrap(), "port=80");
        assert!(root.join("www/css/site.css").exists());

        let journal = fs::read_to_string(work.path().join(JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), ops.len());
    }

    #[tokio::test]
    async fn test_missing_context_file() {
        let context = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let ops = lower("FROM alpine\nCOPY missing.txt /x");

        let err = LocalExecutor::new(context.path())
            .execute(&ops[1], work.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Executor);
    }

    #[tokio::test]
    async fn test_outputs_are_deterministic() {
        let work = TempDir::new().unwrap();
        let ops = lower("FROM alpine\nRUN echo hi");
        let executor = LocalExecutor::new(work.path());
        let cancel = CancellationToken::new();

        let a = executor.execute(&ops[1], work.path(), &cancel).await.unwrap();
        let b = executor.execute(&ops[1], work.path(), &cancel).await.unwrap();
        assert_eq!(a.outputs, b.outputs);
        assert!(a.outputs[0].starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let work = TempDir::new().unwrap();
        let ops = lower("FROM alpine");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LocalExecutor::new(work.path()).execute(&ops[0], work.path(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_exec_failure_is_result() {
        let work = TempDir::new().unwrap();
        let ops = lower("FROM alpine\nRUN exit 3");
        let executor = LocalExecutor::new(work.path()).with_host_exec(true);

        let result = executor.execute(&ops[1], work.path(), &CancellationToken::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exited"));
    }

    #[test]
    fn test_contained_paths() {
        let root = Path::new("/work/rootfs");
        assert_eq!(contained(root, "/etc/../../passwd"), PathBuf::from("/work/rootfs/etc/passwd"));
        assert_eq!(resolve_in_image("/app/", "bin"), "/app/bin");
    }

    #[test]
    fn test_unavailable_executors() {
        let err = create_executor(ExecutorKind::Container, Path::new(".")).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Executor);
        assert_eq!(create_executor(ExecutorKind::Local, Path::new(".")).unwrap().name(), "local");
    }
}
